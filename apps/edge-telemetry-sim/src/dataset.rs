
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub temp: f64,
    pub humidity: f64,
    pub co: f64,
    pub lpg: f64,
    pub smoke: f64,
    pub light: bool,
    pub motion: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub ts: f64,
    pub device: String,
    pub data: SensorData,
}

/// Wire form published on `iot/telemetry/{device_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub device_id: String,
    pub ts: f64,
    pub data: SensorData,
}

impl TelemetryMessage {
    pub fn from_reading(reading: &Reading) -> Self {
        Self {
            device_id: reading.device.clone(),
            ts: reading.ts,
            data: reading.data,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatasetRow {
    ts: f64,
    device: String,
    co: f64,
    humidity: f64,
    light: String,
    lpg: f64,
    motion: String,
    smoke: f64,
    temp: f64,
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "1.0" => Some(true),
        "false" | "0" | "0.0" => Some(false),
        _ => None,
    }
}

pub fn load_readings(path: &Path) -> Result<Vec<Reading>, ConfigurationError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| ConfigurationError::DatasetUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
    read_rows(reader, path)
}

fn read_rows<R: std::io::Read>(
    mut reader: csv::Reader<R>,
    path: &Path,
) -> Result<Vec<Reading>, ConfigurationError> {
    let mut readings = Vec::new();
    for (idx, row) in reader.deserialize::<DatasetRow>().enumerate() {
        // Header is line 1; data rows start at 2.
        let line = idx + 2;
        let row = row.map_err(|source| ConfigurationError::DatasetUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let light = parse_flag(&row.light).ok_or_else(|| ConfigurationError::InvalidRow {
            row: line,
            message: format!("light is not a boolean: {:?}", row.light),
        })?;
        let motion = parse_flag(&row.motion).ok_or_else(|| ConfigurationError::InvalidRow {
            row: line,
            message: format!("motion is not a boolean: {:?}", row.motion),
        })?;
        readings.push(Reading {
            ts: row.ts,
            device: row.device,
            data: SensorData {
                temp: row.temp,
                humidity: row.humidity,
                co: row.co,
                lpg: row.lpg,
                smoke: row.smoke,
                light,
                motion,
            },
        });
    }
    Ok(readings)
}

/// Infinite, restartable sequence over the rows recorded for one device.
#[derive(Debug, Clone)]
pub struct DatasetCursor {
    readings: Vec<Reading>,
    position: usize,
}

impl DatasetCursor {
    pub fn new(rows: Vec<Reading>, device_id: &str) -> Result<Self, ConfigurationError> {
        let mut available = BTreeSet::new();
        let mut readings = Vec::new();
        for row in rows {
            if row.device == device_id {
                readings.push(row);
            } else {
                available.insert(row.device.clone());
            }
        }
        if readings.is_empty() {
            return Err(ConfigurationError::NoReadingsForDevice {
                device_id: device_id.to_string(),
                available: available.into_iter().collect::<Vec<_>>().join(", "),
            });
        }
        Ok(Self {
            readings,
            position: 0,
        })
    }

    pub fn from_csv(path: &Path, device_id: &str) -> Result<Self, ConfigurationError> {
        let rows = load_readings(path)?;
        Self::new(rows, device_id)
    }

    /// Number of readings in one full cycle.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_reading(&mut self) -> Reading {
        let reading = self.readings[self.position].clone();
        self.position = (self.position + 1) % self.readings.len();
        reading
    }
}

impl Iterator for DatasetCursor {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        Some(self.next_reading())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Three readings for `00:0f:00:70:91:0a` and one for another device.
    pub(crate) fn readings() -> Vec<Reading> {
        let reading = |ts: f64, device: &str, temp: f64, motion: bool| Reading {
            ts,
            device: device.to_string(),
            data: SensorData {
                temp,
                humidity: 76.0,
                co: 0.0028,
                lpg: 0.0051,
                smoke: 0.0133,
                light: false,
                motion,
            },
        };
        vec![
            reading(1_594_512_094.7, "00:0f:00:70:91:0a", 19.7, false),
            reading(1_594_512_098.0, "b8:27:eb:bf:9d:51", 22.6, false),
            reading(1_594_512_101.2, "00:0f:00:70:91:0a", 19.8, true),
            reading(1_594_512_104.9, "00:0f:00:70:91:0a", 19.9, false),
        ]
    }

    const SAMPLE_CSV: &str = "\
\"ts\",\"device\",\"co\",\"humidity\",\"light\",\"lpg\",\"motion\",\"smoke\",\"temp\"
1.5945120943859746E9,b8:27:eb:bf:9d:51,0.004955938648391245,51.0,false,0.00765082227055719,false,0.02041127012241292,22.7
1.5945120947355676E9,00:0f:00:70:91:0a,0.0028400886071015706,76.0,false,0.005114383400977071,false,0.013274836704851536,19.700000762939453
1.5945120980735729E9,b8:27:eb:bf:9d:51,0.004976012340421658,50.9,false,0.007673227406398091,false,0.02047512557617824,22.6
1.5945121012305462E9,1c:bf:ce:15:ec:4d,0.004403026829699689,76.80000305175781,true,0.007023337145877314,false,0.018628225377018803,27.0
1.5945121015806098E9,b8:27:eb:bf:9d:51,0.004967363641908952,50.9,false,0.007663577282372411,true,0.02044762845144699,22.6
";

    fn write_dataset(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("iot_telemetry_data.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE_CSV.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_rows_in_order_and_filters_by_device() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir);
        let cursor = DatasetCursor::from_csv(&path, "b8:27:eb:bf:9d:51").unwrap();
        assert_eq!(cursor.len(), 3);

        let readings: Vec<Reading> = cursor.take(3).collect();
        assert_eq!(readings[0].data.temp, 22.7);
        assert_eq!(readings[1].data.temp, 22.6);
        assert!(readings[2].data.motion);
        assert!(readings.iter().all(|r| r.device == "b8:27:eb:bf:9d:51"));
        assert!((readings[0].ts - 1_594_512_094.385_974_6).abs() < 1e-3);
    }

    #[test]
    fn cursor_wraps_after_one_period() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir);
        for device in ["b8:27:eb:bf:9d:51", "00:0f:00:70:91:0a", "1c:bf:ce:15:ec:4d"] {
            let mut cursor = DatasetCursor::from_csv(&path, device).unwrap();
            let period = cursor.len();
            let first = cursor.next_reading();
            for _ in 1..period {
                cursor.next_reading();
            }
            assert_eq!(cursor.position(), 0);
            assert_eq!(cursor.next_reading(), first);
        }
    }

    #[test]
    fn cursor_never_ends() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir);
        let cursor = DatasetCursor::from_csv(&path, "00:0f:00:70:91:0a").unwrap();
        assert_eq!(cursor.take(1000).count(), 1000);
    }

    #[test]
    fn unknown_device_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir);
        let err = DatasetCursor::from_csv(&path, "ff:ff:ff:ff:ff:ff").unwrap_err();
        match err {
            ConfigurationError::NoReadingsForDevice {
                device_id,
                available,
            } => {
                assert_eq!(device_id, "ff:ff:ff:ff:ff:ff");
                assert!(available.contains("b8:27:eb:bf:9d:51"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = load_readings(&dir.path().join("missing.csv")).unwrap_err();
        assert!(matches!(err, ConfigurationError::DatasetUnreadable { .. }));
    }

    #[test]
    fn rejects_non_boolean_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(
            &path,
            "ts,device,co,humidity,light,lpg,motion,smoke,temp\n1.0,dev,0.1,50,maybe,0.1,false,0.1,70\n",
        )
        .unwrap();
        let err = load_readings(&path).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidRow { row: 2, .. }));
    }

    #[test]
    fn telemetry_message_keeps_wire_shape() {
        let reading = Reading {
            ts: 1_594_512_000.0,
            device: "00:0f:00:70:91:0a".to_string(),
            data: SensorData {
                temp: 86.0,
                humidity: 51.0,
                co: 0.0045,
                lpg: 0.0076,
                smoke: 0.0234,
                light: false,
                motion: true,
            },
        };
        let value = serde_json::to_value(TelemetryMessage::from_reading(&reading)).unwrap();
        assert_eq!(value["device_id"], "00:0f:00:70:91:0a");
        assert_eq!(value["ts"], 1_594_512_000.0);
        assert_eq!(value["data"]["temp"], 86.0);
        assert_eq!(value["data"]["light"], false);
        assert_eq!(value["data"]["motion"], true);
    }

    #[test]
    fn in_memory_rows_keep_device_order() {
        let mut cursor = DatasetCursor::new(readings(), "00:0f:00:70:91:0a").unwrap();
        let temps: Vec<f64> = (0..4).map(|_| cursor.next_reading().data.temp).collect();
        assert_eq!(temps, vec![19.7, 19.8, 19.9, 19.7]);
    }
}
