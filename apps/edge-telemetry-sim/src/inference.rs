
use crate::dataset::Reading;
use crate::error::InferenceError;
use crate::metrics::{round_to, InferenceMetric, ModelLoadMetric};
use crate::model::{ComputeDevice, TextModel};
use crate::sampler::{ResourceProbe, ResourceSampler, DEFAULT_SAMPLE_INTERVAL};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Linear power model used to turn CPU utilisation and wall time into energy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyProfile {
    pub base_power_watts: f64,
    pub max_power_watts: f64,
}

impl Default for EnergyProfile {
    // Single-board ARM computer: ~5 W idle, ~15 W under full load.
    fn default() -> Self {
        Self {
            base_power_watts: 5.0,
            max_power_watts: 15.0,
        }
    }
}

impl EnergyProfile {
    pub fn power_watts(&self, cpu_percent: f64) -> f64 {
        let load = cpu_percent.clamp(0.0, 100.0) / 100.0;
        self.base_power_watts + (self.max_power_watts - self.base_power_watts) * load
    }

    pub fn energy_mj(&self, duration: Duration, cpu_percent: f64) -> f64 {
        self.power_watts(cpu_percent) * duration.as_secs_f64() * 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub device_id: String,
    pub max_length: usize,
    pub temperature: f32,
    pub sample_interval: Duration,
    pub energy: EnergyProfile,
}

impl InferenceSettings {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            max_length: 512,
            temperature: 0.7,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            energy: EnergyProfile::default(),
        }
    }
}

pub struct InferenceEngine {
    model: Arc<dyn TextModel>,
    probe: Arc<dyn ResourceProbe>,
    settings: InferenceSettings,
    compute_device: ComputeDevice,
}

impl InferenceEngine {
    pub fn new(
        model: Arc<dyn TextModel>,
        probe: Arc<dyn ResourceProbe>,
        settings: InferenceSettings,
    ) -> Self {
        let compute_device = model.compute_device();
        tracing::info!(
            device_id = %settings.device_id,
            model = model.name(),
            compute_device = %compute_device,
            "inference engine ready"
        );
        Self {
            model,
            probe,
            settings,
            compute_device,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn compute_device(&self) -> ComputeDevice {
        self.compute_device
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }

    fn memory_mb(&self) -> f64 {
        match self.probe.resident_memory_mb() {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error=%err, "could not read resident memory");
                0.0
            }
        }
    }

    /// Loads the model once and reports how long it took and how much memory it added.
    pub async fn load(&self) -> Result<ModelLoadMetric, InferenceError> {
        tracing::info!(model = self.model.name(), "loading model");
        let memory_before = self.memory_mb();
        let started = Instant::now();
        let model = self.model.clone();
        let outcome = tokio::task::spawn_blocking(move || model.load()).await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(InferenceError::new(elapsed, format!("{err:#}"))),
            Err(err) => {
                return Err(InferenceError::new(elapsed, format!("model load panicked: {err}")))
            }
        }
        let memory_delta = self.memory_mb() - memory_before;
        tracing::info!(
            load_seconds = elapsed.as_secs_f64(),
            memory_increase_mb = memory_delta,
            "model loaded"
        );
        Ok(ModelLoadMetric {
            event: "model_loading".to_string(),
            timestamp: now_rfc3339(),
            device_id: self.settings.device_id.clone(),
            model_name: self.model.name().to_string(),
            load_time_seconds: round_to(elapsed.as_secs_f64(), 2),
            memory_increase_mb: round_to(memory_delta, 2),
            compute_device: self.compute_device,
        })
    }

    pub async fn run(&self, prompt: &str) -> Result<(String, InferenceMetric), InferenceError> {
        let memory_before = self.memory_mb();
        let sampler = ResourceSampler::start(self.probe.clone(), self.settings.sample_interval);
        let started = Instant::now();

        let model = self.model.clone();
        let owned_prompt = prompt.to_string();
        let max_length = self.settings.max_length;
        let temperature = self.settings.temperature;
        let outcome = tokio::task::spawn_blocking(move || {
            model.infer(&owned_prompt, max_length, temperature)
        })
        .await;

        let elapsed = started.elapsed();
        let cpu = sampler.stop().await;

        let response = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => return Err(InferenceError::new(elapsed, format!("{err:#}"))),
            Err(err) => {
                return Err(InferenceError::new(elapsed, format!("model call panicked: {err}")))
            }
        };

        let memory_after = self.memory_mb();
        let energy_mj = self.settings.energy.energy_mj(elapsed, cpu.average);
        let seconds = elapsed.as_secs_f64();

        let metric = InferenceMetric {
            timestamp: now_rfc3339(),
            device_id: self.settings.device_id.clone(),
            model_name: self.model.name().to_string(),
            inference_time_seconds: round_to(seconds, 4),
            inference_time_ms: round_to(seconds * 1000.0, 2),
            memory_used_mb: round_to(memory_after - memory_before, 2),
            memory_total_mb: round_to(memory_after, 2),
            cpu_percent_avg: round_to(cpu.average, 2),
            cpu_percent_samples: cpu.samples,
            energy_consumed_mj: round_to(energy_mj, 2),
            energy_consumed_j: round_to(energy_mj / 1000.0, 4),
            compute_device: self.compute_device,
            prompt_length: prompt.chars().count(),
            response_length: response.chars().count(),
        };

        tracing::info!(
            time_ms = metric.inference_time_ms,
            memory_mb = metric.memory_used_mb,
            cpu_percent = metric.cpu_percent_avg,
            energy_mj = metric.energy_consumed_mj,
            "inference complete"
        );

        Ok((response, metric))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn build_analysis_prompt(reading: &Reading) -> String {
    let data = &reading.data;
    format!(
        "Analyze the following IoT sensor data and provide a brief assessment:\n\
         \n\
         Device ID: {device}\n\
         Timestamp: {ts}\n\
         \n\
         Sensor Readings:\n\
         - Temperature: {temp}°F\n\
         - Humidity: {humidity}%\n\
         - CO Level: {co} ppm\n\
         - Smoke: {smoke}\n\
         - LPG: {lpg}\n\
         - Light: {light}\n\
         - Motion: {motion}\n\
         \n\
         Assessment: ",
        device = reading.device,
        ts = reading.ts,
        temp = data.temp,
        humidity = data.humidity,
        co = data.co,
        smoke = data.smoke,
        lpg = data.lpg,
        light = if data.light { "On" } else { "Off" },
        motion = if data.motion { "Detected" } else { "Not detected" },
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dataset::SensorData;
    use crate::sampler::tests::FixedProbe;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct ScriptedModel {
        pub reply: Option<String>,
        pub delay: Duration,
        pub calls: AtomicUsize,
    }

    impl ScriptedModel {
        pub(crate) fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                reply: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TextModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn compute_device(&self) -> ComputeDevice {
            ComputeDevice::Cpu
        }

        fn infer(&self, _prompt: &str, _max_length: usize, _temperature: f32) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.reply.clone().ok_or_else(|| anyhow!("out of memory"))
        }
    }

    pub(crate) fn sample_reading() -> Reading {
        Reading {
            ts: 1_594_512_094.5,
            device: "00:0f:00:70:91:0a".to_string(),
            data: SensorData {
                temp: 19.7,
                humidity: 76.0,
                co: 0.0028,
                lpg: 0.0051,
                smoke: 0.0133,
                light: false,
                motion: true,
            },
        }
    }

    fn engine(model: Arc<dyn TextModel>) -> InferenceEngine {
        let mut settings = InferenceSettings::new("00:0f:00:70:91:0a");
        settings.sample_interval = Duration::from_millis(5);
        InferenceEngine::new(model, Arc::new(FixedProbe::new(50.0, 256.0)), settings)
    }

    #[test]
    fn energy_matches_linear_power_model() {
        let profile = EnergyProfile::default();
        assert_eq!(profile.energy_mj(Duration::from_secs(1), 0.0), 5_000.0);
        assert_eq!(profile.energy_mj(Duration::from_secs(1), 100.0), 15_000.0);
        assert_eq!(profile.energy_mj(Duration::from_secs(2), 50.0), 20_000.0);
    }

    #[test]
    fn energy_is_monotone_in_duration_and_cpu() {
        let profile = EnergyProfile::default();
        let mut last = 0.0;
        for cpu in (0..=100).step_by(10) {
            let energy = profile.energy_mj(Duration::from_millis(750), f64::from(cpu));
            assert!(energy >= last);
            last = energy;
        }
        let mut last = 0.0;
        for ms in (0..=5_000).step_by(250) {
            let energy = profile.energy_mj(Duration::from_millis(ms), 35.0);
            assert!(energy >= last);
            last = energy;
        }
    }

    #[test]
    fn energy_profile_is_configurable() {
        let profile = EnergyProfile {
            base_power_watts: 2.0,
            max_power_watts: 10.0,
        };
        assert_eq!(profile.energy_mj(Duration::from_secs(1), 100.0), 10_000.0);
        assert_eq!(profile.power_watts(250.0), 10.0);
    }

    #[tokio::test]
    async fn run_returns_response_and_metric() {
        let model = Arc::new(ScriptedModel {
            reply: Some("All readings nominal.".to_string()),
            delay: Duration::from_millis(30),
            calls: AtomicUsize::new(0),
        });
        let engine = engine(model.clone());
        let prompt = build_analysis_prompt(&sample_reading());
        let (text, metric) = engine.run(&prompt).await.unwrap();

        assert_eq!(text, "All readings nominal.");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metric.device_id, "00:0f:00:70:91:0a");
        assert_eq!(metric.model_name, "scripted");
        assert_eq!(metric.compute_device, ComputeDevice::Cpu);
        assert_eq!(metric.cpu_percent_avg, 50.0);
        assert_eq!(metric.memory_used_mb, 0.0);
        assert_eq!(metric.memory_total_mb, 256.0);
        assert!(metric.inference_time_ms >= 30.0);
        assert_eq!(metric.prompt_length, prompt.chars().count());
        assert_eq!(metric.response_length, text.len());
        let expected = 10.0 * metric.inference_time_seconds * 1000.0;
        assert!((metric.energy_consumed_mj - expected).abs() < 1.0);
    }

    #[tokio::test]
    async fn failing_model_yields_inference_error() {
        let engine = engine(Arc::new(ScriptedModel::failing()));
        let err = engine.run("prompt").await.unwrap_err();
        assert!(err.message.contains("out of memory"));
        assert!(err.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn load_reports_load_metric() {
        let engine = engine(Arc::new(ScriptedModel::replying("ok")));
        let metric = engine.load().await.unwrap();
        assert_eq!(metric.event, "model_loading");
        assert_eq!(metric.model_name, "scripted");
        assert_eq!(metric.memory_increase_mb, 0.0);
    }

    #[test]
    fn prompt_embeds_sensor_values() {
        let prompt = build_analysis_prompt(&sample_reading());
        assert!(prompt.starts_with("Analyze the following IoT sensor data"));
        assert!(prompt.contains("Device ID: 00:0f:00:70:91:0a"));
        assert!(prompt.contains("- Temperature: 19.7°F"));
        assert!(prompt.contains("- Humidity: 76%"));
        assert!(prompt.contains("- Light: Off"));
        assert!(prompt.contains("- Motion: Detected"));
        assert!(prompt.ends_with("Assessment: "));
    }
}
