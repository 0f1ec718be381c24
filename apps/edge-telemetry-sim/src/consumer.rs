use crate::config::Config;
use crate::dataset::TelemetryMessage;
use anyhow::Result;
use chrono::DateTime;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use std::fmt::Write as _;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const CONSUMER_CLIENT_ID: &str = "telemetry_consumer";

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Broker settings for the telemetry consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub topic_filter: String,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            client_id: CONSUMER_CLIENT_ID.to_string(),
            keep_alive: config.mqtt_keepalive,
            topic_filter: telemetry_filter(&config.mqtt_topic_prefix),
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Wildcard covering every device's telemetry topic.
pub fn telemetry_filter(prefix: &str) -> String {
    format!("{}/telemetry/+", prefix.trim_end_matches('/'))
}

pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetryMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

fn format_ts(ts: f64) -> String {
    if ts == 0.0 || !ts.is_finite() {
        return "unknown".to_string();
    }
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract().abs() * 1e9) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "unknown".to_string(),
    }
}

fn on_off(value: bool, on: &'static str, off: &'static str) -> &'static str {
    if value {
        on
    } else {
        off
    }
}

/// Human-readable block for one telemetry message.
pub fn render_telemetry(topic: &str, qos: QoS, message: &TelemetryMessage) -> String {
    let data = &message.data;
    let mut out = String::new();
    let _ = writeln!(out, "Device: {}", message.device_id);
    let _ = writeln!(out, "Timestamp: {}", format_ts(message.ts));
    let _ = writeln!(out, "Topic: {topic}");
    let _ = writeln!(out, "QoS: {}", qos_level(qos));
    let _ = writeln!(out, "Temperature: {:.1}°F", data.temp);
    let _ = writeln!(out, "Humidity: {:.1}%", data.humidity);
    let _ = writeln!(out, "CO: {:.4} ppm", data.co);
    let _ = writeln!(out, "LPG: {:.4} ppm", data.lpg);
    let _ = writeln!(out, "Smoke: {:.4} ppm", data.smoke);
    let _ = writeln!(out, "Light: {}", on_off(data.light, "ON", "OFF"));
    let _ = write!(out, "Motion: {}", on_off(data.motion, "DETECTED", "NONE"));
    out
}

/// Decodes one incoming publish. Malformed payloads are logged and skipped.
pub fn handle_publish(publish: &Publish) -> Option<TelemetryMessage> {
    match decode_telemetry(publish.payload.as_ref()) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(
                topic = %publish.topic,
                bytes = publish.payload.len(),
                error = %err,
                "skipping malformed telemetry"
            );
            None
        }
    }
}

/// Subscribes to every device's telemetry and prints each message until cancelled.
pub async fn run_consumer(settings: ConsumerSettings, cancel: CancellationToken) -> Result<u64> {
    let mut received = 0u64;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(err) = run_once(&settings, &cancel, &mut received).await {
            tracing::warn!("telemetry consumer loop failed, reconnecting: {err:#}");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }
    tracing::info!(received, "telemetry consumer stopped");
    Ok(received)
}

async fn run_once(
    settings: &ConsumerSettings,
    cancel: &CancellationToken,
    received: &mut u64,
) -> Result<()> {
    let (client, mut eventloop) = AsyncClient::new(settings.mqtt_options(), 64);
    client
        .subscribe(settings.topic_filter.clone(), QoS::AtLeastOnce)
        .await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                client.disconnect().await.ok();
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        tracing::info!(
                            host = %settings.host,
                            port = settings.port,
                            topic = %settings.topic_filter,
                            "subscribed to telemetry"
                        );
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Some(message) = handle_publish(&publish) {
                            *received += 1;
                            println!("{}\n", render_telemetry(&publish.topic, publish.qos, &message));
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => anyhow::bail!("mqtt disconnected"),
                    Ok(_) => {}
                    Err(err) => anyhow::bail!(err),
                }
            }
        }
    }
}
