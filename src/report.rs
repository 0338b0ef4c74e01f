//! Append-only CSV ramp report.

use crate::error::HarnessError;
use crate::telemetry::HostTelemetry;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const HEADER: [&str; 21] = [
    "timestamp",
    "level",
    "devices",
    "concurrency",
    "duration",
    "ok",
    "fail",
    "fail_ratio",
    "rps_avg",
    "rps_ok_avg",
    "p50_ms",
    "p90_ms",
    "p99_ms",
    "bandwidth_pub_out_kbps",
    "bandwidth_pub_in_kbps",
    "cpu_percent",
    "memory_usage",
    "load_1m",
    "load_5m",
    "load_15m",
    "disk_usage_percent",
];

/// One finished ramp level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelRecord {
    pub timestamp: String,
    pub level: u32,
    pub devices: usize,
    pub concurrency: usize,
    pub duration: Duration,
    pub ok: u64,
    pub fail: u64,
    pub fail_ratio: f64,
    pub rps_avg: f64,
    pub rps_ok_avg: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub telemetry: HostTelemetry,
}

impl LevelRecord {
    fn to_row(&self) -> Vec<String> {
        let t = &self.telemetry;
        vec![
            self.timestamp.clone(),
            self.level.to_string(),
            self.devices.to_string(),
            self.concurrency.to_string(),
            self.duration.as_secs().to_string(),
            self.ok.to_string(),
            self.fail.to_string(),
            format!("{:.4}", self.fail_ratio),
            format!("{:.2}", self.rps_avg),
            format!("{:.2}", self.rps_ok_avg),
            fixed(self.p50_ms, 1),
            fixed(self.p90_ms, 1),
            fixed(self.p99_ms, 1),
            optional(t.bandwidth_out_kbps, 1),
            optional(t.bandwidth_in_kbps, 1),
            optional(t.cpu_percent, 1),
            optional(t.memory_percent, 1),
            optional(t.load_1m, 2),
            optional(t.load_5m, 2),
            optional(t.load_15m, 2),
            optional(t.disk_percent, 2),
        ]
    }
}

/// Absent values are written as `nan` so the column stays numeric.
fn optional(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.precision$}"),
        _ => "nan".to_string(),
    }
}

fn fixed(value: f64, precision: usize) -> String {
    optional(Some(value), precision)
}

/// CSV sink. The header goes out only when the file is new (or empty), so
/// repeated ramps against one path keep appending under a single header.
pub struct ReportSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl ReportSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref().to_path_buf();
        let write_header = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes and flushes one row; rows already written survive a later abort.
    pub fn append(&mut self, record: &LevelRecord) -> Result<(), HarnessError> {
        self.writer.write_record(record.to_row())?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(level: u32) -> LevelRecord {
        LevelRecord {
            timestamp: "2025-01-01 00:00:00".to_string(),
            level,
            devices: 100,
            concurrency: 10,
            duration: Duration::from_secs(30),
            ok: 95,
            fail: 5,
            fail_ratio: 0.05,
            rps_avg: 3.333,
            rps_ok_avg: 3.1666,
            p50_ms: 12.34,
            p90_ms: 20.0,
            p99_ms: f64::NAN,
            telemetry: HostTelemetry {
                cpu_percent: Some(55.555),
                load_1m: Some(1.234),
                ..Default::default()
            },
        }
    }

    #[test]
    fn formats_row() {
        let row = record(3).to_row();
        assert_eq!(row.len(), HEADER.len());
        assert_eq!(
            row.join(","),
            "2025-01-01 00:00:00,3,100,10,30,95,5,0.0500,3.33,3.17,12.3,20.0,nan,nan,nan,55.6,nan,1.23,nan,nan,nan"
        );
    }

    #[test]
    fn header_written_once_across_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.csv");

        let mut sink = ReportSink::open(&path).unwrap();
        sink.append(&record(1)).unwrap();
        drop(sink);

        let mut sink = ReportSink::open(&path).unwrap();
        sink.append(&record(1)).unwrap();
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let headers = content.lines().filter(|l| l.starts_with("timestamp,")).count();
        assert_eq!(headers, 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn empty_existing_file_gets_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.csv");
        std::fs::write(&path, "").unwrap();

        ReportSink::open(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("timestamp,level,devices"));
    }
}
