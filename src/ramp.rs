//! Escalating load levels until the target (or the harness) gives out.
//!
//! Each level runs the swarm at a fixed shape, appends one report row and then
//! decides: stop on a delivery mismatch, stop on too many failures, stop on too
//! few successes, or step devices and concurrency up and go again. The loop
//! also ends quietly once either quantity passes its configured maximum.

use crate::error::HarnessError;
use crate::report::{LevelRecord, ReportSink};
use crate::stats::RunStats;
use crate::swarm::LoadShape;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Hard ceiling on in-flight requests, whatever the configured step says.
pub const CONCURRENCY_CEILING: usize = 5000;

/// Runs one level. Implemented by the swarm; stubbed in tests.
pub trait LevelRunner {
    fn run_level(
        &self,
        shape: LoadShape,
    ) -> impl Future<Output = Result<RunStats, HarnessError>> + Send;
}

#[derive(Debug, Clone)]
pub struct RampSettings {
    pub devices_start: usize,
    pub devices_step: usize,
    pub max_devices: usize,
    pub concurrency_start: usize,
    pub concurrency_step: usize,
    pub max_concurrency: usize,
    pub duration_per_level: Duration,
    /// Per-device send interval, needed for the delivery check.
    pub interval: Duration,
    pub failure_threshold: f64,
    pub min_ok: u64,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            devices_start: 10_000,
            devices_step: 0,
            max_devices: 30_000,
            concurrency_start: 1_000,
            concurrency_step: 0,
            max_concurrency: 10_000,
            duration_per_level: Duration::from_secs(30),
            interval: Duration::from_secs(30),
            failure_threshold: 0.5,
            min_ok: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The harness sent a different number of reports than the schedule allows.
    DeliveryMismatch { expected: u64, observed: u64 },
    FailureThreshold { fail_ratio: f64, threshold: f64 },
    InsufficientSuccesses { ok: u64, min_ok: u64 },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::DeliveryMismatch { expected, observed } => write!(
                f,
                "delivery mismatch: expected {expected} messages but observed {observed}"
            ),
            StopReason::FailureThreshold {
                fail_ratio,
                threshold,
            } => write!(
                f,
                "failure threshold: fail_ratio {fail_ratio:.3} exceeded {threshold}"
            ),
            StopReason::InsufficientSuccesses { ok, min_ok } => {
                write!(f, "insufficient successes: ok responses {ok} < min_ok {min_ok}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Advance { devices: usize, concurrency: usize },
    Stop(StopReason),
}

/// Reports each device can send in `duration`: `ceil(duration / interval)`, at least 1.
pub fn expected_per_device(duration: Duration, interval: Duration) -> u64 {
    if interval.is_zero() {
        return 1;
    }
    ((duration.as_secs_f64() / interval.as_secs_f64()).ceil() as u64).max(1)
}

pub fn expected_total(devices: usize, duration: Duration, interval: Duration) -> u64 {
    devices as u64 * expected_per_device(duration, interval)
}

/// Next level's shape; concurrency never exceeds [`CONCURRENCY_CEILING`].
pub fn next_shape(settings: &RampSettings, devices: usize, concurrency: usize) -> (usize, usize) {
    (
        devices.saturating_add(settings.devices_step),
        concurrency
            .saturating_add(settings.concurrency_step)
            .min(CONCURRENCY_CEILING),
    )
}

pub fn evaluate(settings: &RampSettings, shape: LoadShape, stats: &RunStats) -> Verdict {
    let expected = expected_total(shape.devices, shape.duration, settings.interval);
    if stats.sent != expected {
        return Verdict::Stop(StopReason::DeliveryMismatch {
            expected,
            observed: stats.sent,
        });
    }

    let fail_ratio = stats.fail_ratio();
    if fail_ratio > settings.failure_threshold {
        return Verdict::Stop(StopReason::FailureThreshold {
            fail_ratio,
            threshold: settings.failure_threshold,
        });
    }
    if stats.ok < settings.min_ok {
        return Verdict::Stop(StopReason::InsufficientSuccesses {
            ok: stats.ok,
            min_ok: settings.min_ok,
        });
    }

    let (devices, concurrency) = next_shape(settings, shape.devices, shape.concurrency);
    Verdict::Advance {
        devices,
        concurrency,
    }
}

pub fn level_record(level: u32, shape: LoadShape, stats: &RunStats) -> LevelRecord {
    let secs = shape.duration.as_secs_f64();
    let per_sec = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
    LevelRecord {
        timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        level,
        devices: shape.devices,
        concurrency: shape.concurrency,
        duration: shape.duration,
        ok: stats.ok,
        fail: stats.fail,
        fail_ratio: stats.fail_ratio(),
        rps_avg: per_sec(stats.sent),
        rps_ok_avg: per_sec(stats.ok),
        p50_ms: stats.percentile(50.0),
        p90_ms: stats.percentile(90.0),
        p99_ms: stats.percentile(99.0),
        telemetry: stats.telemetry,
    }
}

/// Every level written, plus why the ramp stopped (`None`: limits reached).
#[derive(Debug, Clone)]
pub struct RampOutcome {
    pub levels: Vec<LevelRecord>,
    pub stop: Option<StopReason>,
}

pub struct RampController<R> {
    runner: R,
    settings: RampSettings,
}

impl<R: LevelRunner> RampController<R> {
    pub fn new(runner: R, settings: RampSettings) -> Self {
        Self { runner, settings }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub async fn run(&self, sink: &mut ReportSink) -> Result<RampOutcome, HarnessError> {
        let settings = &self.settings;
        let mut devices = settings.devices_start;
        let mut concurrency = settings.concurrency_start.min(CONCURRENCY_CEILING);
        if concurrency < settings.concurrency_start {
            warn!("Capping starting concurrency at {}", CONCURRENCY_CEILING);
        }
        let mut level = 0u32;
        let mut levels = Vec::new();
        let mut stop = None;

        while devices <= settings.max_devices && concurrency <= settings.max_concurrency {
            level += 1;
            let shape = LoadShape {
                devices,
                concurrency,
                duration: settings.duration_per_level,
            };
            info!(
                "=== Level {}: devices={} concurrency={} duration={}s ===",
                level,
                devices,
                concurrency,
                shape.duration.as_secs()
            );

            let stats = self.runner.run_level(shape).await?;
            let record = level_record(level, shape, &stats);
            sink.append(&record)?;
            info!(
                "Level {} summary: ok={} fail={} fail_ratio={:.3} rps_avg={:.2} rps_ok_avg={:.2}",
                level, record.ok, record.fail, record.fail_ratio, record.rps_avg, record.rps_ok_avg
            );
            levels.push(record);

            match evaluate(settings, shape, &stats) {
                Verdict::Stop(reason) => {
                    warn!("Stopping: {}", reason);
                    if matches!(reason, StopReason::DeliveryMismatch { .. }) {
                        info!(
                            "Hint: each device should send {} messages per level; increase --launch-rate or --duration-per-level",
                            expected_per_device(shape.duration, settings.interval)
                        );
                    }
                    stop = Some(reason);
                    break;
                }
                Verdict::Advance {
                    devices: next_devices,
                    concurrency: next_concurrency,
                } => {
                    if next_concurrency == CONCURRENCY_CEILING
                        && concurrency.saturating_add(settings.concurrency_step) > CONCURRENCY_CEILING
                    {
                        warn!("Capping concurrency at {}", CONCURRENCY_CEILING);
                    }
                    devices = next_devices;
                    concurrency = next_concurrency;
                }
            }
        }

        info!("Ramp complete. Report written to {}", sink.path().display());
        Ok(RampOutcome { levels, stop })
    }
}
