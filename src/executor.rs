//! One ingest call per report, under the swarm-wide concurrency cap.

use crate::device::PositionReport;
use crate::error::HarnessError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use url::Url;

const USER_AGENT: &str = "osmand-sim/1.0";
const BODY_EXCERPT_BYTES: usize = 120;

/// What the ingest endpoint answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResponse {
    pub status: u16,
    /// The first bytes of the body, kept for failure samples.
    pub body_excerpt: String,
}

/// Transport seam between the swarm and the ingest endpoint.
///
/// `Err` means no HTTP status was obtained (connect error, timeout, broken body).
pub trait IngestClient: Clone + Send + Sync + 'static {
    fn submit(
        &self,
        report: &PositionReport,
    ) -> impl Future<Output = Result<IngestResponse, String>> + Send;

    /// Where `report` goes, rendered for failure samples.
    fn target(&self, report: &PositionReport) -> String {
        let query: Vec<String> = report
            .query_pairs()
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        format!("?{}", query.join("&"))
    }
}

/// Histogram key for one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusKey {
    Http(u16),
    Exception,
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKey::Http(code) => write!(f, "{code}"),
            StatusKey::Exception => f.write_str("exception"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { status: u16 },
    Rejected { status: u16, body_excerpt: String },
    Transport { error: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn status_key(&self) -> StatusKey {
        match self {
            Outcome::Success { status } | Outcome::Rejected { status, .. } => StatusKey::Http(*status),
            Outcome::Transport { .. } => StatusKey::Exception,
        }
    }

    /// Human-readable failure line ending with the request target; `None` for successes.
    pub fn failure_sample(&self, device_id: i64, target: Option<&str>) -> Option<String> {
        let mut line = match self {
            Outcome::Success { .. } => return None,
            Outcome::Rejected {
                status,
                body_excerpt,
            } => format!("dev={device_id} status={status} body={body_excerpt:?}"),
            Outcome::Transport { error } => format!("dev={device_id} exception={error}"),
        };
        if let Some(target) = target {
            line.push_str(" url=");
            line.push_str(target);
        }
        Some(line)
    }
}

impl From<Result<IngestResponse, String>> for Outcome {
    fn from(result: Result<IngestResponse, String>) -> Self {
        match result {
            Ok(response) if (200..300).contains(&response.status) => Outcome::Success {
                status: response.status,
            },
            Ok(response) => Outcome::Rejected {
                status: response.status,
                body_excerpt: response.body_excerpt,
            },
            Err(error) => Outcome::Transport { error },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub latency: Duration,
    pub outcome: Outcome,
    /// Rendered request target, kept only for failures.
    pub target: Option<String>,
}

/// Issues reports through an [`IngestClient`], at most `concurrency` at a time.
///
/// No retries: a failed tick is recorded once and never resent.
pub struct RequestExecutor<C> {
    client: C,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl<C: IngestClient> RequestExecutor<C> {
    pub fn new(client: C, concurrency: usize) -> Self {
        let concurrency = concurrency.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            client,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn execute(&self, report: &PositionReport) -> RequestOutcome {
        let started = Instant::now();
        // The permit is released on drop, whatever the call returned.
        let result = match self.permits.acquire().await {
            Ok(_permit) => self.client.submit(report).await,
            Err(_) => Err("concurrency limiter closed".to_string()),
        };
        let latency = started.elapsed();
        let outcome: Outcome = result.into();
        let target = (!outcome.is_success()).then(|| self.client.target(report));
        RequestOutcome {
            latency,
            outcome,
            target,
        }
    }
}

// =============================================================================
// HTTP client
// =============================================================================

/// Sends reports as `GET <base>/?id=..&lat=..` requests.
#[derive(Clone, Debug)]
pub struct HttpIngestClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpIngestClient {
    pub fn new(base: &str, insecure: bool) -> Result<Self, HarnessError> {
        let base = Url::parse(base)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self { http, base })
    }

    pub fn report_url(&self, report: &PositionReport) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(report.query_pairs());
        url
    }
}

impl IngestClient for HttpIngestClient {
    fn target(&self, report: &PositionReport) -> String {
        self.report_url(report).into()
    }

    async fn submit(&self, report: &PositionReport) -> Result<IngestResponse, String> {
        let url = self.report_url(report);
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        // Read the whole body so the connection goes back to the pool.
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        let excerpt = &body[..body.len().min(BODY_EXCERPT_BYTES)];
        Ok(IngestResponse {
            status,
            body_excerpt: String::from_utf8_lossy(excerpt).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn report(id: i64) -> PositionReport {
        PositionReport {
            device_id: id,
            latitude: 10.5,
            longitude: 123.25,
            timestamp: 1_700_000_000,
            speed_mps: 4.0,
            bearing: 90.0,
        }
    }

    /// Answers with a fixed status after a short delay and tracks peak concurrency.
    #[derive(Clone)]
    struct SlowClient {
        status: Result<u16, String>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SlowClient {
        fn new(status: Result<u16, String>) -> Self {
            Self {
                status,
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl IngestClient for SlowClient {
        async fn submit(&self, _report: &PositionReport) -> Result<IngestResponse, String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.status.clone().map(|status| IngestResponse {
                status,
                body_excerpt: "nope".to_string(),
            })
        }
    }

    #[test]
    fn classifies_statuses() {
        let ok: Outcome = Ok(IngestResponse {
            status: 204,
            body_excerpt: String::new(),
        })
        .into();
        assert!(ok.is_success());
        assert_eq!(ok.status_key(), StatusKey::Http(204));

        let rejected: Outcome = Ok(IngestResponse {
            status: 503,
            body_excerpt: "busy".to_string(),
        })
        .into();
        assert!(!rejected.is_success());
        assert_eq!(
            rejected.failure_sample(7, None).as_deref(),
            Some("dev=7 status=503 body=\"busy\"")
        );
        assert_eq!(
            rejected.failure_sample(7, Some("?id=7")).as_deref(),
            Some("dev=7 status=503 body=\"busy\" url=?id=7")
        );
        assert_eq!(ok.failure_sample(7, Some("?id=7")), None);

        let redirect: Outcome = Ok(IngestResponse {
            status: 302,
            body_excerpt: String::new(),
        })
        .into();
        assert!(!redirect.is_success());

        let transport: Outcome = Err("connection refused".to_string()).into();
        assert_eq!(transport.status_key(), StatusKey::Exception);
        assert_eq!(transport.status_key().to_string(), "exception");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped_and_permits_return() {
        let client = SlowClient::new(Ok(200));
        let executor = Arc::new(RequestExecutor::new(client.clone(), 3));

        let tasks: Vec<_> = (0..20)
            .map(|id| {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move { executor.execute(&report(id)).await })
            })
            .collect();
        for task in futures_util::future::join_all(tasks).await {
            let result = task.unwrap();
            assert!(result.outcome.is_success());
            assert_eq!(result.target, None);
        }

        assert_eq!(executor.concurrency(), 3);
        assert!(client.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(executor.available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_release_permits_and_measure_latency() {
        let executor = RequestExecutor::new(SlowClient::new(Err("reset".to_string())), 1);
        for id in 0..5 {
            let result = executor.execute(&report(id)).await;
            assert_eq!(result.outcome.status_key(), StatusKey::Exception);
            assert!(result.latency >= Duration::from_millis(20));
        }
        assert_eq!(executor.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_carry_the_request_target() {
        let executor = RequestExecutor::new(SlowClient::new(Ok(503)), 0);
        assert_eq!(executor.concurrency(), 1);

        let result = executor.execute(&report(9)).await;
        let target = result.target.as_deref();
        assert_eq!(
            target,
            Some("?id=9&lat=10.500000&lon=123.250000&timestamp=1700000000&speed=4.00&bearing=90.0")
        );
        let sample = result.outcome.failure_sample(9, target).unwrap();
        assert!(sample.starts_with("dev=9 status=503 body=\"nope\" url=?id=9&lat="));
    }

    #[test]
    fn builds_ingest_url() {
        let client = HttpIngestClient::new("http://127.0.0.1:5055", false).unwrap();
        let url = client.report_url(&report(42));
        let expected =
            "http://127.0.0.1:5055/?id=42&lat=10.500000&lon=123.250000&timestamp=1700000000&speed=4.00&bearing=90.0";
        assert_eq!(url.as_str(), expected);
        assert_eq!(client.target(&report(42)), expected);
    }
}
