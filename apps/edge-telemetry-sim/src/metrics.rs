use crate::model::ComputeDevice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One record per completed inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceMetric {
    pub timestamp: String,
    pub device_id: String,
    pub model_name: String,
    pub inference_time_seconds: f64,
    pub inference_time_ms: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub cpu_percent_avg: f64,
    pub cpu_percent_samples: usize,
    pub energy_consumed_mj: f64,
    pub energy_consumed_j: f64,
    pub compute_device: ComputeDevice,
    pub prompt_length: usize,
    pub response_length: usize,
}

/// Emitted once when the model is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLoadMetric {
    pub event: String,
    pub timestamp: String,
    pub device_id: String,
    pub model_name: String,
    pub load_time_seconds: f64,
    pub memory_increase_mb: f64,
    pub compute_device: ComputeDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TotalStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub device_id: String,
    pub model_name: String,
    pub total_inferences: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_time_ms: Option<Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_consumption_mj: Option<TotalStats>,
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn min_max_sum(values: impl Iterator<Item = f64>) -> Option<(f64, f64, f64, usize)> {
    let mut out: Option<(f64, f64, f64, usize)> = None;
    for value in values {
        out = Some(match out {
            None => (value, value, value, 1),
            Some((min, max, sum, n)) => (min.min(value), max.max(value), sum + value, n + 1),
        });
    }
    out
}

fn stats(values: impl Iterator<Item = f64>) -> Option<Stats> {
    let (min, max, sum, n) = min_max_sum(values)?;
    Some(Stats {
        min: round_to(min, 2),
        max: round_to(max, 2),
        avg: round_to(sum / n as f64, 2),
    })
}

fn total_stats(values: impl Iterator<Item = f64>) -> Option<TotalStats> {
    let (min, max, sum, n) = min_max_sum(values)?;
    Some(TotalStats {
        min: round_to(min, 2),
        max: round_to(max, 2),
        avg: round_to(sum / n as f64, 2),
        total: round_to(sum, 2),
    })
}

impl MetricsSummary {
    pub fn from_log(device_id: &str, model_name: &str, log: &[InferenceMetric]) -> Self {
        Self {
            device_id: device_id.to_string(),
            model_name: model_name.to_string(),
            total_inferences: log.len(),
            inference_time_ms: stats(log.iter().map(|m| m.inference_time_ms)),
            memory_usage_mb: stats(log.iter().map(|m| m.memory_used_mb)),
            cpu_usage_percent: stats(log.iter().map(|m| m.cpu_percent_avg)),
            energy_consumption_mj: total_stats(log.iter().map(|m| m.energy_consumed_mj)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct LogKey {
    device_id: String,
    model_name: String,
}

/// Append-only metric logs, one per (device, model) pair.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    logs: BTreeMap<LogKey, Vec<InferenceMetric>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metric: InferenceMetric) {
        let key = LogKey {
            device_id: metric.device_id.clone(),
            model_name: metric.model_name.clone(),
        };
        self.logs.entry(key).or_default().push(metric);
    }

    pub fn log(&self, device_id: &str, model_name: &str) -> &[InferenceMetric] {
        let key = LogKey {
            device_id: device_id.to_string(),
            model_name: model_name.to_string(),
        };
        self.logs.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn summary(&self, device_id: &str, model_name: &str) -> MetricsSummary {
        MetricsSummary::from_log(device_id, model_name, self.log(device_id, model_name))
    }

    pub fn len(&self) -> usize {
        self.logs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices with at least one recorded metric, sorted.
    pub fn devices(&self) -> Vec<String> {
        let mut out: Vec<String> = self.logs.keys().map(|k| k.device_id.clone()).collect();
        out.dedup();
        out
    }

    pub fn models_for(&self, device_id: &str) -> Vec<String> {
        self.logs
            .keys()
            .filter(|k| k.device_id == device_id)
            .map(|k| k.model_name.clone())
            .collect()
    }
}
