//! Shared counters for one swarm run.
//!
//! Device tasks run on a multi-threaded runtime, so the counters are atomics
//! and the containers sit behind one mutex. `sent` is bumped in the same
//! `record` call as `ok`/`fail`, which keeps `sent == ok + fail` once every
//! device task has finished.

use crate::error::HarnessError;
use crate::executor::{RequestOutcome, StatusKey};
use crate::telemetry::HostTelemetry;
use hdrhistogram::Histogram;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

pub const DEFAULT_LATENCY_WINDOW: usize = 200_000;

/// Highest latency the whole-run histogram tracks, in microseconds.
const HISTOGRAM_MAX_US: u64 = 120_000_000;

struct Collected {
    latencies_ms: VecDeque<f64>,
    statuses: HashMap<StatusKey, u64>,
    failure_samples: Vec<String>,
    histogram: Histogram<u64>,
}

pub struct StatsAggregator {
    sent: AtomicU64,
    ok: AtomicU64,
    fail: AtomicU64,
    latency_window: usize,
    failure_sample_cap: usize,
    collected: Mutex<Collected>,
}

impl StatsAggregator {
    /// `failure_sample_cap` bounds the failure lines kept between drains; 0 keeps none.
    pub fn new(latency_window: usize, failure_sample_cap: usize) -> Result<Self, HarnessError> {
        let latency_window = latency_window.max(1);
        Ok(Self {
            sent: AtomicU64::new(0),
            ok: AtomicU64::new(0),
            fail: AtomicU64::new(0),
            latency_window,
            failure_sample_cap,
            collected: Mutex::new(Collected {
                latencies_ms: VecDeque::with_capacity(latency_window.min(4096)),
                statuses: HashMap::new(),
                failure_samples: Vec::new(),
                histogram: Histogram::new_with_bounds(1, HISTOGRAM_MAX_US, 3)?,
            }),
        })
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn ok(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn fail(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    pub async fn record(&self, device_id: i64, result: &RequestOutcome) {
        let latency_ms = result.latency.as_secs_f64() * 1000.0;
        {
            let mut collected = self.collected.lock().await;
            if collected.latencies_ms.len() == self.latency_window {
                collected.latencies_ms.pop_front();
            }
            collected.latencies_ms.push_back(latency_ms);
            collected
                .histogram
                .saturating_record((result.latency.as_micros() as u64).max(1));
            *collected
                .statuses
                .entry(result.outcome.status_key())
                .or_insert(0) += 1;

            if collected.failure_samples.len() < self.failure_sample_cap {
                if let Some(sample) = result
                    .outcome
                    .failure_sample(device_id, result.target.as_deref())
                {
                    collected.failure_samples.push(sample);
                }
            }
        }

        if result.outcome.is_success() {
            self.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fail.fetch_add(1, Ordering::Relaxed);
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes the buffered failure samples, opening a new sampling window.
    pub async fn drain_failure_samples(&self) -> Vec<String> {
        std::mem::take(&mut self.collected.lock().await.failure_samples)
    }

    /// The `limit` most frequent statuses, ties broken by key.
    pub async fn top_statuses(&self, limit: usize) -> Vec<(StatusKey, u64)> {
        let collected = self.collected.lock().await;
        let mut statuses: Vec<_> = collected.statuses.iter().map(|(k, v)| (*k, *v)).collect();
        sort_statuses(&mut statuses);
        statuses.truncate(limit);
        statuses
    }

    /// Freezes the aggregate into a [`RunStats`]. Call once all device tasks are done.
    pub async fn finish(&self, telemetry: HostTelemetry) -> RunStats {
        let collected = self.collected.lock().await;
        let mut latencies_ms: Vec<f64> = collected.latencies_ms.iter().copied().collect();
        latencies_ms.sort_by(f64::total_cmp);

        let mut statuses: Vec<_> = collected.statuses.iter().map(|(k, v)| (*k, *v)).collect();
        sort_statuses(&mut statuses);

        let histogram = &collected.histogram;
        let latency_summary = (histogram.len() > 0).then(|| LatencySummary {
            min_ms: histogram.min() as f64 / 1000.0,
            mean_ms: histogram.mean() / 1000.0,
            p95_ms: histogram.value_at_quantile(0.95) as f64 / 1000.0,
            max_ms: histogram.max() as f64 / 1000.0,
        });

        RunStats {
            sent: self.sent(),
            ok: self.ok(),
            fail: self.fail(),
            statuses,
            latencies_ms,
            latency_summary,
            telemetry,
        }
    }
}

fn sort_statuses(statuses: &mut [(StatusKey, u64)]) {
    statuses.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
}

/// Whole-run latency figures from the histogram (every request, not just the window).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

/// Finalised statistics of one run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub sent: u64,
    pub ok: u64,
    pub fail: u64,
    /// Ordered by count descending.
    pub statuses: Vec<(StatusKey, u64)>,
    /// Sorted ascending; the most recent window of samples only.
    pub latencies_ms: Vec<f64>,
    pub latency_summary: Option<LatencySummary>,
    pub telemetry: HostTelemetry,
}

impl RunStats {
    pub fn percentile(&self, p: f64) -> f64 {
        percentile(&self.latencies_ms, p)
    }

    pub fn fail_ratio(&self) -> f64 {
        self.fail as f64 / self.sent.max(1) as f64
    }
}

/// Nearest-rank style percentile over an ascending slice: index
/// `floor(len × p / 100)` clamped to the slice. NaN when empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (sorted.len() as f64 * p / 100.0).floor();
    let index = if rank.is_nan() || rank < 0.0 {
        0
    } else {
        (rank as usize).min(sorted.len() - 1)
    };
    sorted[index]
}
