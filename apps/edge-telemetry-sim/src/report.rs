use crate::metrics::{MetricsSummary, Stats};
use crate::persist::MetricsArtifact;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Reads every artifact under `dir`, keeping the newest one per device and model.
pub fn load_artifacts(dir: &Path, device: Option<&str>) -> Result<Vec<MetricsArtifact>> {
    let mut files: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let name = path.file_name().and_then(|v| v.to_str()).unwrap_or("");
            name.starts_with("inference_metrics_") && name.ends_with(".json")
        })
        .collect();
    files.sort_by_cached_key(|path| (save_order(path), path.clone()));
    tracing::info!(dir = %dir.display(), files = files.len(), "found metrics files");

    let mut latest: BTreeMap<String, MetricsArtifact> = BTreeMap::new();
    for path in files {
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let artifact: MetricsArtifact = match serde_json::from_slice(&raw) {
            Ok(artifact) => artifact,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable artifact");
                continue;
            }
        };
        if device.is_some_and(|d| d != artifact.summary.device_id) {
            continue;
        }
        let key = format!(
            "{}_{}",
            artifact.summary.device_id, artifact.summary.model_name
        );
        latest.insert(key, artifact);
    }
    Ok(latest.into_values().collect())
}

/// `(stamp, seq)` from `{kind}_{device}_{YYYYmmdd}_{HHMMSS}_{mmm}_{seq}.json`.
/// Names that do not parse order before every stamped one.
fn save_order(path: &Path) -> (String, u32) {
    let stem = path.file_stem().and_then(|v| v.to_str()).unwrap_or("");
    let mut parts = stem.rsplitn(5, '_');
    let (Some(seq), Some(millis), Some(time), Some(date), Some(_)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return (String::new(), 0);
    };
    let digits = |v: &str, len: usize| v.len() == len && v.bytes().all(|b| b.is_ascii_digit());
    match seq.parse::<u32>() {
        Ok(seq) if digits(date, 8) && digits(time, 6) && digits(millis, 3) => {
            (format!("{date}{time}{millis}"), seq)
        }
        _ => (String::new(), 0),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRow {
    pub label: String,
    pub device_id: String,
    pub model_name: String,
    pub avg_time_ms: f64,
    pub avg_memory_mb: f64,
    pub avg_cpu_percent: f64,
    pub total_energy_mj: f64,
}

impl ComparisonRow {
    fn from_summary(summary: &MetricsSummary) -> Self {
        let short_model = summary
            .model_name
            .rsplit('/')
            .next()
            .unwrap_or(&summary.model_name);
        let short_device: String = summary.device_id.chars().take(8).collect();
        let avg = |stats: Option<Stats>| stats.map(|s| s.avg).unwrap_or(0.0);
        Self {
            label: format!("{short_model} ({short_device})"),
            device_id: summary.device_id.clone(),
            model_name: summary.model_name.clone(),
            avg_time_ms: avg(summary.inference_time_ms),
            avg_memory_mb: avg(summary.memory_usage_mb),
            avg_cpu_percent: avg(summary.cpu_usage_percent),
            total_energy_mj: summary
                .energy_consumption_mj
                .map(|s| s.total)
                .unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestPerformers {
    pub fastest: ComparisonRow,
    pub least_memory: ComparisonRow,
    pub least_cpu: ComparisonRow,
    pub least_energy: ComparisonRow,
}

pub fn comparison_rows(artifacts: &[MetricsArtifact]) -> Vec<ComparisonRow> {
    artifacts
        .iter()
        .map(|a| ComparisonRow::from_summary(&a.summary))
        .collect()
}

fn lowest(rows: &[ComparisonRow], key: impl Fn(&ComparisonRow) -> f64) -> Option<ComparisonRow> {
    rows.iter()
        .min_by(|a, b| key(a).total_cmp(&key(b)))
        .cloned()
}

pub fn compare(artifacts: &[MetricsArtifact]) -> Option<BestPerformers> {
    let rows = comparison_rows(artifacts);
    Some(BestPerformers {
        fastest: lowest(&rows, |r| r.avg_time_ms)?,
        least_memory: lowest(&rows, |r| r.avg_memory_mb)?,
        least_cpu: lowest(&rows, |r| r.avg_cpu_percent)?,
        least_energy: lowest(&rows, |r| r.total_energy_mj)?,
    })
}

fn write_stats(out: &mut String, title: &str, stats: Option<Stats>) {
    if let Some(stats) = stats {
        let _ = writeln!(out, "  {title}: min {:.2}  max {:.2}  avg {:.2}", stats.min, stats.max, stats.avg);
    }
}

pub fn render_summaries(artifacts: &[MetricsArtifact]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "LLM INFERENCE METRICS SUMMARY");
    for artifact in artifacts {
        let summary = &artifact.summary;
        let _ = writeln!(out);
        let _ = writeln!(out, "Device: {}", summary.device_id);
        let _ = writeln!(out, "Model: {}", summary.model_name);
        let _ = writeln!(out, "Total inferences: {}", summary.total_inferences);
        write_stats(&mut out, "Inference time (ms)", summary.inference_time_ms);
        write_stats(&mut out, "Memory usage (MB)", summary.memory_usage_mb);
        write_stats(&mut out, "CPU usage (%)", summary.cpu_usage_percent);
        if let Some(energy) = summary.energy_consumption_mj {
            let _ = writeln!(
                out,
                "  Energy (mJ): min {:.2}  max {:.2}  avg {:.2}  total {:.2} ({:.4} J)",
                energy.min,
                energy.max,
                energy.avg,
                energy.total,
                energy.total / 1000.0
            );
        }
    }
    out
}

pub fn render_comparison(artifacts: &[MetricsArtifact]) -> String {
    let mut out = String::new();
    let rows = comparison_rows(artifacts);
    let _ = writeln!(out, "MODEL COMPARISON");
    let _ = writeln!(
        out,
        "{:<40} {:<15} {:<15} {:<12} {:<18}",
        "Model", "Avg Time (ms)", "Avg Memory (MB)", "Avg CPU (%)", "Total Energy (mJ)"
    );
    for row in &rows {
        let _ = writeln!(
            out,
            "{:<40} {:<15.2} {:<15.2} {:<12.2} {:<18.2}",
            row.label, row.avg_time_ms, row.avg_memory_mb, row.avg_cpu_percent, row.total_energy_mj
        );
    }
    if let Some(best) = compare(artifacts) {
        let _ = writeln!(out);
        let _ = writeln!(out, "BEST PERFORMERS");
        let _ = writeln!(out, "Fastest inference: {} ({:.2} ms)", best.fastest.label, best.fastest.avg_time_ms);
        let _ = writeln!(out, "Most memory efficient: {} ({:.2} MB)", best.least_memory.label, best.least_memory.avg_memory_mb);
        let _ = writeln!(out, "Lowest CPU usage: {} ({:.2}%)", best.least_cpu.label, best.least_cpu.avg_cpu_percent);
        let _ = writeln!(out, "Most energy efficient: {} ({:.2} mJ)", best.least_energy.label, best.least_energy.total_energy_mj);
    }
    out
}

pub fn export_csv(artifacts: &[MetricsArtifact], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record([
        "Device ID",
        "Model Name",
        "Total Inferences",
        "Avg Inference Time (ms)",
        "Min Inference Time (ms)",
        "Max Inference Time (ms)",
        "Avg Memory (MB)",
        "Min Memory (MB)",
        "Max Memory (MB)",
        "Avg CPU (%)",
        "Min CPU (%)",
        "Max CPU (%)",
        "Total Energy (mJ)",
        "Avg Energy (mJ)",
        "Min Energy (mJ)",
        "Max Energy (mJ)",
    ])?;
    for artifact in artifacts {
        let s = &artifact.summary;
        let triple = |stats: Option<Stats>| {
            let stats = stats.unwrap_or(Stats { min: 0.0, max: 0.0, avg: 0.0 });
            [stats.avg, stats.min, stats.max].map(|v| v.to_string())
        };
        let energy = s
            .energy_consumption_mj
            .map(|e| [e.total, e.avg, e.min, e.max])
            .unwrap_or([0.0; 4])
            .map(|v| v.to_string());

        let mut record = vec![
            s.device_id.clone(),
            s.model_name.clone(),
            s.total_inferences.to_string(),
        ];
        record.extend(triple(s.inference_time_ms));
        record.extend(triple(s.memory_usage_mb));
        record.extend(triple(s.cpu_usage_percent));
        record.extend(energy);
        writer.write_record(&record)?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = artifacts.len(), "exported metrics");
    Ok(())
}
