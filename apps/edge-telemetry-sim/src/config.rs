use crate::error::ConfigurationError;
use crate::inference::{EnergyProfile, InferenceSettings};
use crate::model::ComputeDevice;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: String,
    pub device_name: String,
    pub dataset_path: PathBuf,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,
    pub mqtt_keepalive: Duration,

    pub publish_interval_min: Duration,
    pub publish_interval_max: Duration,

    pub inference_enabled: bool,
    pub model_name: String,
    pub model_endpoint: Option<Url>,
    pub model_timeout: Duration,
    pub compute_device: Option<ComputeDevice>,
    pub inference_interval: u64,
    pub max_length: usize,
    pub temperature: f32,
    pub sample_interval: Duration,
    pub energy: EnergyProfile,

    pub metrics_dir: PathBuf,
    pub metrics_save_interval: u64,

    pub status_http_bind: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A missing .env file is the normal container case.
        let _ = dotenvy::dotenv();

        let device_id = env_string("DEVICE_ID", Some("00:0f:00:70:91:0a".to_string()))?;
        let device_name = env_string("DEVICE_NAME", Some("edge-device".to_string()))?;
        let dataset_path = PathBuf::from(env_string(
            "DATASET_PATH",
            Some("/app/dataset/iot_telemetry_data.csv".to_string()),
        )?);

        let (mqtt_host, mqtt_port) = match env_optional("MQTT_URL") {
            Some(raw) => {
                let url = Url::parse(&raw).context("invalid MQTT_URL")?;
                let host = url
                    .host_str()
                    .ok_or_else(|| anyhow!("MQTT_URL missing host"))?
                    .to_string();
                (host, url.port().unwrap_or(1883))
            }
            None => {
                let host = env_string("MQTT_BROKER", Some("mqtt-broker".to_string()))?;
                let port = u16::try_from(env_u64("MQTT_PORT", Some(1883))?)
                    .context("MQTT_PORT out of range")?;
                (host, port)
            }
        };
        let mqtt_username = env_optional("MQTT_USERNAME");
        let mqtt_password = env_optional("MQTT_PASSWORD");
        let mqtt_topic_prefix = env_string("MQTT_TOPIC_PREFIX", Some("iot".to_string()))?;
        let mqtt_client_id = env_string(
            "MQTT_CLIENT_ID",
            Some(format!("{}_{}", device_name, device_id)),
        )?;
        let mqtt_keepalive = Duration::from_secs(env_u64("MQTT_KEEPALIVE_SECS", Some(60))?);

        let publish_interval_min =
            Duration::from_secs_f64(env_f64("PUBLISH_INTERVAL_MIN_SECS", Some(1.0))?.max(0.0));
        let publish_interval_max =
            Duration::from_secs_f64(env_f64("PUBLISH_INTERVAL_MAX_SECS", Some(5.0))?.max(0.0));

        let inference_enabled = env_bool("ENABLE_LLM_INFERENCE", false)?;
        let model_name = env_string(
            "LLM_MODEL_NAME",
            Some("microsoft/Phi-3.5-mini-instruct".to_string()),
        )?;
        let model_endpoint = match env_optional("LLM_ENDPOINT") {
            Some(raw) => Some(parse_endpoint(&raw)?),
            None => None,
        };
        let model_timeout = Duration::from_secs(env_u64("LLM_REQUEST_TIMEOUT_SECS", Some(300))?);
        let compute_device = match env_optional("LLM_COMPUTE_DEVICE") {
            Some(raw) => Some(
                ComputeDevice::parse(&raw)
                    .ok_or_else(|| anyhow!("invalid LLM_COMPUTE_DEVICE {raw:?} (cpu|cuda)"))?,
            ),
            None => None,
        };
        let inference_interval = env_u64("LLM_INFERENCE_INTERVAL", Some(5))?;
        let max_length = env_u64("LLM_MAX_LENGTH", Some(512))? as usize;
        let temperature = env_f64("LLM_TEMPERATURE", Some(0.7))? as f32;
        let sample_interval = Duration::from_millis(env_u64("SAMPLER_INTERVAL_MS", Some(100))?);
        let energy = EnergyProfile {
            base_power_watts: env_f64("ENERGY_BASE_POWER_WATTS", Some(5.0))?,
            max_power_watts: env_f64("ENERGY_MAX_POWER_WATTS", Some(15.0))?,
        };

        let metrics_dir = PathBuf::from(env_string("METRICS_DIR", Some("/app/metrics".to_string()))?);
        let metrics_save_interval = env_u64("METRICS_SAVE_INTERVAL", Some(10))?;

        let status_http_bind = env_optional("STATUS_HTTP_BIND");

        let config = Self {
            device_id,
            device_name,
            dataset_path,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_client_id,
            mqtt_keepalive,
            publish_interval_min,
            publish_interval_max,
            inference_enabled,
            model_name,
            model_endpoint,
            model_timeout,
            compute_device,
            inference_interval,
            max_length,
            temperature,
            sample_interval,
            energy,
            metrics_dir,
            metrics_save_interval,
            status_http_bind,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |key: &'static str, message: &str| ConfigurationError::InvalidSetting {
            key,
            message: message.to_string(),
        };
        if self.device_id.is_empty() {
            return Err(invalid("DEVICE_ID", "must not be empty"));
        }
        if self.inference_interval == 0 {
            return Err(invalid("LLM_INFERENCE_INTERVAL", "must be at least 1"));
        }
        if self.metrics_save_interval == 0 {
            return Err(invalid("METRICS_SAVE_INTERVAL", "must be at least 1"));
        }
        if self.publish_interval_min > self.publish_interval_max {
            return Err(invalid(
                "PUBLISH_INTERVAL_MIN_SECS",
                "must not exceed PUBLISH_INTERVAL_MAX_SECS",
            ));
        }
        if !(self.temperature.is_finite() && self.temperature >= 0.0) {
            return Err(invalid("LLM_TEMPERATURE", "must be a non-negative number"));
        }
        if self.energy.base_power_watts < 0.0
            || self.energy.max_power_watts < self.energy.base_power_watts
        {
            return Err(invalid(
                "ENERGY_MAX_POWER_WATTS",
                "must be at least ENERGY_BASE_POWER_WATTS (both non-negative)",
            ));
        }
        if self.inference_enabled && self.model_endpoint.is_none() {
            return Err(invalid("LLM_ENDPOINT", "required when ENABLE_LLM_INFERENCE is set"));
        }
        Ok(())
    }

    pub fn inference_settings(&self) -> InferenceSettings {
        InferenceSettings {
            device_id: self.device_id.clone(),
            max_length: self.max_length,
            temperature: self.temperature,
            sample_interval: self.sample_interval,
            energy: self.energy,
        }
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    // Url::join replaces the last path segment unless the base ends with '/'.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).with_context(|| format!("invalid LLM_ENDPOINT {raw:?}"))
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<f64>()
                .with_context(|| format!("invalid {key}"))?;
            if parsed.is_finite() {
                Ok(parsed)
            } else {
                Err(anyhow!("invalid {key}: not a finite number"))
            }
        }
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    let Some(raw) = env_optional(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("invalid {key}: expected true/false")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
