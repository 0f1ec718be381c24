use crate::error::PersistenceError;
use crate::metrics::{InferenceMetric, MetricsAggregator, MetricsSummary, ModelLoadMetric};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// On-disk shape of one saved metrics log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsArtifact {
    pub summary: MetricsSummary,
    pub detailed_metrics: Vec<InferenceMetric>,
}

pub struct MetricsPersister {
    dir: PathBuf,
}

impl MetricsPersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes one artifact per model logged for `device_id`. Never overwrites.
    pub fn save(
        &self,
        aggregator: &MetricsAggregator,
        device_id: &str,
    ) -> Result<Vec<PathBuf>, PersistenceError> {
        let mut written = Vec::new();
        for model in aggregator.models_for(device_id) {
            let log = aggregator.log(device_id, &model);
            let artifact = MetricsArtifact {
                summary: MetricsSummary::from_log(device_id, &model, log),
                detailed_metrics: log.to_vec(),
            };
            let path = self.write_new("inference_metrics", device_id, &artifact)?;
            tracing::info!(
                path = %path.display(),
                model = %model,
                inferences = log.len(),
                "metrics saved"
            );
            written.push(path);
        }
        Ok(written)
    }

    pub fn save_load_metric(&self, metric: &ModelLoadMetric) -> Result<PathBuf, PersistenceError> {
        let path = self.write_new("loading_metrics", &metric.device_id, metric)?;
        tracing::info!(path = %path.display(), "load metrics saved");
        Ok(path)
    }

    fn write_new<T: Serialize>(
        &self,
        kind: &str,
        device_id: &str,
        value: &T,
    ) -> Result<PathBuf, PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let body = serde_json::to_vec_pretty(value)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();
        let device = sanitize(device_id);

        let mut seq = 0u32;
        loop {
            let path = self.dir.join(format!("{kind}_{device}_{stamp}_{seq}.json"));
            let file = OpenOptions::new().write(true).create_new(true).open(&path);
            match file {
                Ok(mut file) => {
                    let written = file.write_all(&body).and_then(|_| file.sync_data());
                    drop(file);
                    finish_write(&path, written)?;
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => seq += 1,
                Err(source) => return Err(PersistenceError::Write { path, source }),
            }
        }
    }
}

/// A failed write leaves no truncated artifact behind.
fn finish_write(path: &Path, written: io::Result<()>) -> Result<(), PersistenceError> {
    let Err(source) = written else {
        return Ok(());
    };
    if let Err(err) = fs::remove_file(path) {
        tracing::debug!(path = %path.display(), error = %err, "failed to remove partial artifact");
    }
    Err(PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn sanitize(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '-',
            other => other,
        })
        .collect()
}
