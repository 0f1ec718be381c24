
use crate::config::Config;
use crate::dataset::{DatasetCursor, Reading, TelemetryMessage};
use crate::error::TransportError;
use crate::inference::{build_analysis_prompt, InferenceEngine};
use crate::metrics::MetricsAggregator;
use crate::mqtt::{publish_json, Topics, Transport};
use crate::persist::MetricsPersister;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub device_id: String,
    pub topics: Topics,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub inference_interval: u64,
    pub save_interval: u64,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl PublishSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_id: config.device_id.clone(),
            topics: Topics::new(&config.mqtt_topic_prefix, &config.device_id),
            delay_min: config.publish_interval_min,
            delay_max: config.publish_interval_max,
            inference_interval: config.inference_interval.max(1),
            save_interval: config.metrics_save_interval.max(1),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Disconnected,
    Connecting,
    Connected,
    Publishing,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub device_id: String,
    pub state: LoopState,
    pub messages_published: u64,
    pub inference_attempts: u64,
    pub inference_failures: u64,
    pub metrics_recorded: u64,
    pub last_saved: Option<PathBuf>,
    pub last_error: Option<String>,
}

#[derive(Serialize)]
struct AnalysisMessage<'a> {
    analysis: &'a str,
    telemetry_input: &'a TelemetryMessage,
    model_name: &'a str,
    timestamp: String,
}

pub struct PublishLoop<T: Transport> {
    transport: T,
    cursor: DatasetCursor,
    engine: Option<InferenceEngine>,
    aggregator: MetricsAggregator,
    persister: MetricsPersister,
    settings: PublishSettings,
    status: LoopStatus,
    status_tx: watch::Sender<LoopStatus>,
}

impl<T: Transport> PublishLoop<T> {
    pub fn new(
        transport: T,
        cursor: DatasetCursor,
        engine: Option<InferenceEngine>,
        persister: MetricsPersister,
        settings: PublishSettings,
    ) -> Self {
        let status = LoopStatus {
            device_id: settings.device_id.clone(),
            state: LoopState::Disconnected,
            messages_published: 0,
            inference_attempts: 0,
            inference_failures: 0,
            metrics_recorded: 0,
            last_saved: None,
            last_error: None,
        };
        let (status_tx, _) = watch::channel(status.clone());
        Self {
            transport,
            cursor,
            engine,
            aggregator: MetricsAggregator::new(),
            persister,
            settings,
            status,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> &LoopStatus {
        &self.status
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    fn notify(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn set_state(&mut self, state: LoopState) {
        if self.status.state != state {
            tracing::debug!(device_id = %self.settings.device_id, state = ?state, "publish loop state");
            self.status.state = state;
            self.notify();
        }
    }

    fn next_delay(&self) -> Duration {
        let min = self.settings.delay_min.as_secs_f64();
        let max = self.settings.delay_max.as_secs_f64();
        if max <= min {
            return self.settings.delay_min;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
    }

    /// Runs until `shutdown` fires, then flushes metrics and disconnects.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        tracing::info!(
            device_id = %self.settings.device_id,
            readings = self.cursor.len(),
            inference = self.engine.is_some(),
            "starting telemetry publishing"
        );
        'session: loop {
            if !self.connect(&shutdown).await {
                break;
            }
            loop {
                self.set_state(LoopState::Publishing);
                let published = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'session,
                    result = self.publish_next() => result,
                };
                if let Err(err) = published {
                    tracing::warn!(error = %err, "publish failed, dropping connection");
                    self.status.last_error = Some(err.to_string());
                    self.set_state(LoopState::Disconnected);
                    continue 'session;
                }
                let delay = self.next_delay();
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'session,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        self.shutdown().await;
    }

    /// Returns false when shutdown interrupted the attempt.
    async fn connect(&mut self, shutdown: &CancellationToken) -> bool {
        let mut backoff = self.settings.reconnect_initial;
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            self.set_state(LoopState::Connecting);
            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                result = self.transport.connect() => result,
            };
            match attempt {
                Ok(()) => {
                    self.set_state(LoopState::Connected);
                    return true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, retry_in = ?backoff, "reconnecting");
                    self.status.last_error = Some(err.to_string());
                    self.set_state(LoopState::Disconnected);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.reconnect_max);
                }
            }
        }
    }

    /// Publishes one reading and, when due, runs one inference on it.
    pub async fn publish_next(&mut self) -> Result<(), TransportError> {
        let reading = self.cursor.next_reading();
        let message = TelemetryMessage::from_reading(&reading);
        publish_json(&mut self.transport, &self.settings.topics.telemetry, &message).await?;

        self.status.messages_published += 1;
        self.notify();
        tracing::info!(
            device_id = %message.device_id,
            count = self.status.messages_published,
            temp = message.data.temp,
            humidity = message.data.humidity,
            co = message.data.co,
            "telemetry published"
        );

        if self.engine.is_some()
            && self.status.messages_published % self.settings.inference_interval == 0
        {
            self.run_inference(&reading, &message).await?;
        }
        Ok(())
    }

    async fn run_inference(
        &mut self,
        reading: &Reading,
        message: &TelemetryMessage,
    ) -> Result<(), TransportError> {
        let Some(engine) = self.engine.as_ref() else {
            return Ok(());
        };
        self.status.inference_attempts += 1;
        let prompt = build_analysis_prompt(reading);
        let (analysis, metric) = match engine.run(&prompt).await {
            Ok(done) => done,
            Err(err) => {
                tracing::warn!(error = %err, "inference failed, telemetry continues");
                self.status.inference_failures += 1;
                self.status.last_error = Some(err.to_string());
                self.notify();
                return Ok(());
            }
        };
        let model_name = metric.model_name.clone();

        self.aggregator.record(metric.clone());
        self.status.metrics_recorded += 1;
        let logged = self.aggregator.log(&metric.device_id, &model_name).len() as u64;
        if logged % self.settings.save_interval == 0 {
            self.save_device_metrics();
        }
        self.notify();

        let topics = &self.settings.topics;
        publish_json(
            &mut self.transport,
            &topics.analysis,
            &AnalysisMessage {
                analysis: &analysis,
                telemetry_input: message,
                model_name: &model_name,
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            },
        )
        .await?;
        publish_json(&mut self.transport, &topics.metrics, &metric).await?;
        let summary = self.aggregator.summary(&metric.device_id, &model_name);
        publish_json(&mut self.transport, &topics.summary, &summary).await?;
        Ok(())
    }

    fn save_device_metrics(&mut self) {
        match self.persister.save(&self.aggregator, &self.settings.device_id) {
            Ok(paths) => {
                if let Some(last) = paths.into_iter().last() {
                    self.status.last_saved = Some(last);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, dir = %self.persister.dir().display(), "failed to save metrics");
                self.status.last_error = Some(err.to_string());
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!(
            device_id = %self.settings.device_id,
            messages = self.status.messages_published,
            "shutting down publish loop"
        );
        for device in self.aggregator.devices() {
            match self.persister.save(&self.aggregator, &device) {
                Ok(paths) => {
                    if let Some(last) = paths.into_iter().last() {
                        self.status.last_saved = Some(last);
                    }
                }
                Err(err) => tracing::warn!(error = %err, device_id = %device, "final metrics flush failed"),
            }
        }
        self.transport.disconnect().await;
        self.set_state(LoopState::Stopped);
    }
}
