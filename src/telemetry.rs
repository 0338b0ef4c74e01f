//! Best-effort host metrics from the DigitalOcean monitoring API.
//!
//! Every metric is fetched independently and degrades to `None` on a missing
//! credential, an HTTP error or an empty series. Nothing here can fail a run.

use crate::error::HarnessError;
use serde::Deserialize;
use sonic_rs::JsonValueTrait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com";

/// Host snapshot appended to every ramp row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostTelemetry {
    pub bandwidth_out_kbps: Option<f64>,
    pub bandwidth_in_kbps: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
    pub disk_percent: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct DropletCredentials {
    pub api_key: String,
    pub droplet_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    data: MetricsData,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsData {
    #[serde(default)]
    result: Vec<MetricSeries>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricSeries {
    #[serde(default)]
    pub metric: HashMap<String, String>,
    /// `[timestamp, value]` pairs; values arrive as strings or numbers.
    #[serde(default)]
    pub values: Vec<Vec<sonic_rs::Value>>,
}

impl MetricSeries {
    fn sample(&self, from_end: usize) -> Option<f64> {
        let point = self.values.iter().rev().nth(from_end)?;
        let value = point.get(1)?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
            .filter(|v| v.is_finite())
    }

    pub fn latest(&self) -> Option<f64> {
        self.sample(0)
    }

    /// Absolute change between the two most recent samples.
    pub fn last_delta(&self) -> Option<f64> {
        Some((self.sample(0)? - self.sample(1)?).abs())
    }
}

pub fn parse_series(body: &str) -> Result<Vec<MetricSeries>, HarnessError> {
    let response: MetricsResponse = sonic_rs::from_str(body)?;
    Ok(response.data.result)
}

/// `(1 − idleΔ / totalΔ) × 100` over the last two samples of every CPU mode.
pub fn cpu_percent(series: &[MetricSeries]) -> Option<f64> {
    let mut idle = 0.0;
    let mut total = 0.0;
    for s in series {
        let Some(delta) = s.last_delta() else {
            continue;
        };
        if s.metric.get("mode").map(String::as_str) == Some("idle") {
            idle = delta;
        }
        total += delta;
    }
    (total > 0.0).then(|| (1.0 - idle / total) * 100.0)
}

/// Share of `total` not covered by `remaining`, in percent.
pub fn used_percent(total: f64, remaining: f64) -> Option<f64> {
    (total > 0.0 && total.is_finite()).then(|| (total - remaining) / total * 100.0)
}

// =============================================================================
// Collector
// =============================================================================

pub struct TelemetryCollector {
    http: reqwest::Client,
    api_base: String,
    credentials: Option<DropletCredentials>,
}

impl TelemetryCollector {
    pub fn new(api_base: &str, credentials: Option<DropletCredentials>) -> Result<Self, HarnessError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// A collector that never calls out and always reports an empty snapshot.
    pub fn disabled() -> Result<Self, HarnessError> {
        Self::new(DEFAULT_API_URL, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    pub async fn snapshot(&self) -> HostTelemetry {
        if !self.is_enabled() {
            debug!("Telemetry credentials not configured, skipping host metrics");
            return HostTelemetry::default();
        }

        let (bandwidth_out_kbps, bandwidth_in_kbps, cpu_percent, memory_percent) = tokio::join!(
            self.bandwidth_kbps(Direction::Outbound),
            self.bandwidth_kbps(Direction::Inbound),
            self.cpu_percent(),
            self.memory_percent(),
        );
        let (load_1m, load_5m, load_15m, disk_percent) = tokio::join!(
            self.load_average("load_1"),
            self.load_average("load_5"),
            self.load_average("load_15"),
            self.disk_percent(),
        );

        HostTelemetry {
            bandwidth_out_kbps,
            bandwidth_in_kbps,
            cpu_percent,
            memory_percent,
            load_1m,
            load_5m,
            load_15m,
            disk_percent,
        }
    }

    /// Latest public-interface sample; the API reports MB/s.
    pub async fn bandwidth_kbps(&self, direction: Direction) -> Option<f64> {
        let series = self
            .fetch(
                "bandwidth",
                60,
                &[("interface", "public"), ("direction", direction.as_str())],
            )
            .await?;
        series.first()?.latest().map(|mbps| mbps * 1000.0)
    }

    pub async fn cpu_percent(&self) -> Option<f64> {
        let series = self.fetch("cpu", 120, &[]).await?;
        let cpu = cpu_percent(&series);
        if cpu.is_none() {
            warn!("No CPU usage delta found in monitoring metrics");
        }
        cpu
    }

    pub async fn memory_percent(&self) -> Option<f64> {
        let (total, available) = tokio::join!(
            self.fetch("memory_total", 60, &[]),
            self.fetch("memory_available", 60, &[]),
        );
        let total = total?.first()?.latest()?;
        let available = available?.first()?.latest()?;
        used_percent(total, available)
    }

    pub async fn disk_percent(&self) -> Option<f64> {
        let (size, free) = tokio::join!(
            self.fetch("filesystem_size", 100, &[]),
            self.fetch("filesystem_free", 100, &[]),
        );
        let size = size?.last()?.latest()?;
        let free = free?.last()?.latest()?;
        used_percent(size, free)
    }

    async fn load_average(&self, metric: &str) -> Option<f64> {
        self.fetch(metric, 60, &[]).await?.first()?.latest()
    }

    async fn fetch(
        &self,
        metric: &str,
        window_secs: i64,
        extra: &[(&str, &str)],
    ) -> Option<Vec<MetricSeries>> {
        let credentials = self.credentials.as_ref()?;
        match self.query(credentials, metric, window_secs, extra).await {
            Ok(series) if series.is_empty() => {
                debug!("Monitoring metric {} returned no series", metric);
                None
            }
            Ok(series) => Some(series),
            Err(e) => {
                warn!("Error fetching {} metric: {}", metric, e);
                None
            }
        }
    }

    async fn query(
        &self,
        credentials: &DropletCredentials,
        metric: &str,
        window_secs: i64,
        extra: &[(&str, &str)],
    ) -> Result<Vec<MetricSeries>, HarnessError> {
        let end = chrono::Utc::now().timestamp();
        let start = end - window_secs;
        let mut url = Url::parse(&format!(
            "{}/v2/monitoring/metrics/droplet/{}",
            self.api_base, metric
        ))?;
        url.query_pairs_mut()
            .append_pair("host_id", &credentials.droplet_id)
            .extend_pairs(extra)
            .append_pair("start", &start.to_string())
            .append_pair("end", &end.to_string());

        let response = self
            .http
            .get(url.clone())
            .bearer_auth(&credentials.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HarnessError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        parse_series(&response.text().await?)
    }
}
