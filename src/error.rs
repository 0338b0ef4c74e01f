//! Harness-level errors.
//!
//! Only misconfiguration, device-pool and report-sink problems surface as
//! errors. Per-request failures are recorded as outcomes and telemetry gaps
//! as absent values, so neither appears here.

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Invalid JSON: {0}")]
    Json(#[from] sonic_rs::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Report error: {0}")]
    Report(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Histogram error: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("No devices with '{prefix}' prefix found")]
    EmptyPool { prefix: String },

    #[error("Device pool holds {available} devices but {requested} were requested")]
    PoolTooSmall { requested: usize, available: usize },
}

impl HarnessError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }
}
