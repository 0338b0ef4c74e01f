//! One fixed-duration load run: launch the devices, let each tick until the
//! deadline, then collect the stats.

use crate::device::{DeviceSimulator, SimulationArea};
use crate::error::HarnessError;
use crate::executor::{IngestClient, RequestExecutor};
use crate::pool::DevicePool;
use crate::ramp::LevelRunner;
use crate::rate_limiter::RateLimiter;
use crate::stats::{RunStats, StatsAggregator, DEFAULT_LATENCY_WINDOW};
use crate::telemetry::TelemetryCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

const LAUNCH_BACKOFF: Duration = Duration::from_millis(10);
/// Headroom over `devices / duration` so launching finishes inside the window.
const LAUNCH_HEADROOM: f64 = 1.1;
const TOP_STATUSES: usize = 3;

/// Run-independent swarm parameters.
#[derive(Debug, Clone)]
pub struct SwarmSettings {
    pub interval: Duration,
    pub launch_rate: f64,
    pub seed: u64,
    pub area: SimulationArea,
    pub progress_interval: Duration,
    /// Failure lines kept per progress window.
    pub failure_sample_cap: usize,
    pub status_summary: bool,
    /// Print and clear buffered failure samples with each progress line.
    pub show_failures: bool,
    pub latency_window: usize,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            launch_rate: 1000.0,
            seed: 42,
            area: SimulationArea::default(),
            progress_interval: Duration::from_secs(10),
            failure_sample_cap: 5,
            status_summary: false,
            show_failures: false,
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

/// The per-run load: how many devices, how many calls in flight, for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadShape {
    pub devices: usize,
    pub concurrency: usize,
    pub duration: Duration,
}

/// `max(configured, 1.1 × devices / duration)` devices per second.
pub fn effective_launch_rate(configured: f64, devices: usize, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64().max(1.0);
    configured.max(LAUNCH_HEADROOM * devices as f64 / secs)
}

pub struct SwarmRunner<C> {
    client: C,
    pool: Arc<DevicePool>,
    telemetry: TelemetryCollector,
    settings: SwarmSettings,
}

impl<C: IngestClient> SwarmRunner<C> {
    pub fn new(
        client: C,
        pool: Arc<DevicePool>,
        telemetry: TelemetryCollector,
        settings: SwarmSettings,
    ) -> Self {
        Self {
            client,
            pool,
            telemetry,
            settings,
        }
    }

    pub fn settings(&self) -> &SwarmSettings {
        &self.settings
    }

    pub async fn run(&self, shape: LoadShape) -> Result<RunStats, HarnessError> {
        let devices = self.pool.take(shape.devices)?;
        let stats = Arc::new(StatsAggregator::new(
            self.settings.latency_window,
            self.settings.failure_sample_cap,
        )?);
        let executor = Arc::new(RequestExecutor::new(self.client.clone(), shape.concurrency));

        let stop_at = Instant::now() + shape.duration;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let reporter = tokio::spawn(report_progress(
            Arc::clone(&stats),
            self.settings.clone(),
            shutdown_tx.subscribe(),
        ));

        let configured = self.settings.launch_rate;
        let rate = effective_launch_rate(configured, devices.len(), shape.duration);
        info!(
            "Launching {} devices at {:.2} devices/sec (configured {:.2})",
            devices.len(),
            rate,
            configured
        );

        let mut limiter = RateLimiter::new(rate);
        let mut tasks = Vec::with_capacity(devices.len());
        for device in devices {
            if !launch_slot(&mut limiter, stop_at).await {
                warn!(
                    "Run window closed after launching {} of {} devices",
                    tasks.len(),
                    devices.len()
                );
                break;
            }

            let simulator = DeviceSimulator::new(device.id, self.settings.seed, self.settings.area);
            tasks.push(tokio::spawn(run_device(
                simulator,
                Arc::clone(&executor),
                Arc::clone(&stats),
                self.settings.interval,
                stop_at,
            )));
        }
        debug!("All {} device tasks launched", tasks.len());

        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Device task failed: {}", e);
            }
        }

        shutdown_tx.send(()).ok();
        if let Err(e) = reporter.await {
            error!("Progress reporter failed: {}", e);
        }

        let telemetry = self.telemetry.snapshot().await;
        Ok(stats.finish(telemetry).await)
    }
}

impl<C: IngestClient> LevelRunner for SwarmRunner<C> {
    async fn run_level(&self, shape: LoadShape) -> Result<RunStats, HarnessError> {
        self.run(shape).await
    }
}

/// Waits for a launch token; `false` once `deadline` passes without one.
async fn launch_slot(limiter: &mut RateLimiter, deadline: Instant) -> bool {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        if limiter.try_acquire() {
            return true;
        }
        sleep(LAUNCH_BACKOFF.min(deadline - now)).await;
    }
}

/// Ticks one device on a fixed schedule until `stop_at`.
///
/// The schedule advances by `interval` per report, independent of how long
/// the call took, so a slow call is caught up one tick at a time rather than
/// shifting every later tick.
async fn run_device<C: IngestClient>(
    mut device: DeviceSimulator,
    executor: Arc<RequestExecutor<C>>,
    stats: Arc<StatsAggregator>,
    interval: Duration,
    stop_at: Instant,
) {
    let dt = interval.as_secs_f64();
    let mut next_send = Instant::now();

    while Instant::now() < stop_at {
        if Instant::now() < next_send {
            sleep_until(next_send.min(stop_at)).await;
            continue;
        }

        let report = device.tick(dt, chrono::Utc::now().timestamp());
        let result = executor.execute(&report).await;
        stats.record(device.id(), &result).await;
        next_send += interval;
    }
}

async fn report_progress(
    stats: Arc<StatsAggregator>,
    settings: SwarmSettings,
    mut shutdown: broadcast::Receiver<()>,
) {
    let every = settings.progress_interval;
    let mut ticker = interval_at(Instant::now() + every, every);
    let mut last_sent = 0;
    let mut last_at = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let sent = stats.sent();
                let elapsed = now.duration_since(last_at).as_secs_f64().max(f64::EPSILON);
                let rps = (sent - last_sent) as f64 / elapsed;

                let mut line = format!(
                    "sent={} ok={} fail={} rps={:.1}",
                    sent,
                    stats.ok(),
                    stats.fail(),
                    rps
                );
                if settings.status_summary {
                    let top: Vec<String> = stats
                        .top_statuses(TOP_STATUSES)
                        .await
                        .into_iter()
                        .map(|(key, count)| format!("{key}:{count}"))
                        .collect();
                    line.push_str(&format!(" statuses={}", top.join(",")));
                }
                info!("{}", line);

                if settings.show_failures {
                    let samples = stats.drain_failure_samples().await;
                    if !samples.is_empty() {
                        info!("  sample failures:");
                        for sample in samples {
                            info!("    {}", sample);
                        }
                    }
                }

                last_sent = sent;
                last_at = now;
            }
        }
    }
}

/// Logs the end-of-run summary for a single run.
pub fn log_run_summary(shape: LoadShape, interval: Duration, stats: &RunStats) {
    let secs = shape.duration.as_secs_f64();
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║                       RUN SUMMARY                          ║");
    info!("╚════════════════════════════════════════════════════════════╝");
    info!(
        "Devices: {}, Interval: {}s, Duration: {}s",
        shape.devices,
        interval.as_secs(),
        shape.duration.as_secs()
    );
    info!(
        "Total requests: {}, OK: {}, Fail: {}",
        stats.sent, stats.ok, stats.fail
    );
    if secs > 0.0 {
        info!(
            "Average RPS over {}s: total={:.2}, ok={:.2}",
            shape.duration.as_secs(),
            stats.sent as f64 / secs,
            stats.ok as f64 / secs
        );
    }
    if !stats.statuses.is_empty() {
        info!("Status breakdown:");
        for (key, count) in &stats.statuses {
            info!("  {}: {}", key, count);
        }
    }
    if stats.sent > 0 {
        info!(
            "P50: {:.1} ms, P90: {:.1} ms, P99: {:.1} ms",
            stats.percentile(50.0),
            stats.percentile(90.0),
            stats.percentile(99.0)
        );
    }
    if let Some(summary) = stats.latency_summary {
        info!(
            "Whole run: min {:.1} ms, mean {:.1} ms, p95 {:.1} ms, max {:.1} ms",
            summary.min_ms, summary.mean_ms, summary.p95_ms, summary.max_ms
        );
    }
    if let Some(kbps) = stats.telemetry.bandwidth_out_kbps {
        info!("Outbound bandwidth (latest 1m sample): {:.2} kbps", kbps);
    }
    info!("═══════════════════════════════════════════════════════════");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PositionReport;
    use crate::executor::IngestResponse;
    use crate::tracker::RemoteDevice;

    /// Answers 200, except 503 for device ids divisible by `fail_every`.
    #[derive(Clone)]
    struct FakeIngest {
        fail_every: i64,
        latency: Duration,
    }

    impl IngestClient for FakeIngest {
        async fn submit(&self, report: &PositionReport) -> Result<IngestResponse, String> {
            sleep(self.latency).await;
            let status = if self.fail_every > 0 && report.device_id % self.fail_every == 0 {
                503
            } else {
                200
            };
            Ok(IngestResponse {
                status,
                body_excerpt: String::new(),
            })
        }
    }

    fn pool(size: i64) -> Arc<DevicePool> {
        let devices = (1..=size)
            .map(|id| RemoteDevice {
                id,
                name: format!("SIMU{id:05}"),
                unique_id: format!("SIMU{id:05}"),
            })
            .collect();
        Arc::new(DevicePool::from_devices(devices, "SIM").unwrap())
    }

    fn runner(client: FakeIngest, pool_size: i64, launch_rate: f64) -> SwarmRunner<FakeIngest> {
        let settings = SwarmSettings {
            interval: Duration::from_secs(10),
            launch_rate,
            status_summary: true,
            show_failures: true,
            ..Default::default()
        };
        SwarmRunner::new(
            client,
            pool(pool_size),
            TelemetryCollector::disabled().unwrap(),
            settings,
        )
    }

    fn shape(devices: usize) -> LoadShape {
        LoadShape {
            devices,
            concurrency: 4,
            duration: Duration::from_secs(30),
        }
    }

    #[test]
    fn launch_rate_has_a_floor() {
        let rate = effective_launch_rate(1.0, 300, Duration::from_secs(30));
        assert!((rate - 11.0).abs() < 1e-9);
        assert_eq!(effective_launch_rate(1000.0, 300, Duration::from_secs(30)), 1000.0);
        // a zero duration is treated as one second
        assert!((effective_launch_rate(0.0, 10, Duration::ZERO) - 11.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn every_device_sends_once_per_interval() {
        let client = FakeIngest {
            fail_every: 0,
            latency: Duration::from_millis(40),
        };
        let stats = runner(client, 20, 1000.0).run(shape(10)).await.unwrap();
        assert_eq!(stats.sent, 30);
        assert_eq!(stats.ok, 30);
        assert_eq!(stats.fail, 0);
        assert_eq!(stats.latencies_ms.len(), 30);
        assert!(stats.percentile(50.0) >= 40.0);
        assert!(stats.telemetry.cpu_percent.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_not_retried() {
        let client = FakeIngest {
            fail_every: 2,
            latency: Duration::from_millis(5),
        };
        let stats = runner(client, 10, 1000.0).run(shape(10)).await.unwrap();
        assert_eq!(stats.sent, 30);
        assert_eq!(stats.fail, 15);
        assert_eq!(stats.sent, stats.ok + stats.fail);
        assert_eq!(stats.statuses.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_do_not_add_ticks() {
        // Each call takes longer than the interval: the device falls behind
        // but never sends more than one report per scheduled tick.
        let client = FakeIngest {
            fail_every: 0,
            latency: Duration::from_secs(12),
        };
        let stats = runner(client, 5, 1000.0).run(shape(5)).await.unwrap();
        assert!(stats.sent <= 15);
        assert_eq!(stats.sent, stats.ok + stats.fail);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_rate_below_floor_is_raised() {
        // 0.01/s alone would start one device per 100s; the floor of
        // 1.1 × 10 / 30 (below one token per two seconds) still starts
        // everyone inside the window, but the late starters miss ticks.
        let client = FakeIngest {
            fail_every: 0,
            latency: Duration::from_millis(1),
        };
        let runner = runner(client, 10, 0.01);
        assert_eq!(runner.settings().launch_rate, 0.01);
        let started = Instant::now();
        let stats = tokio::time::timeout(Duration::from_secs(60), runner.run(shape(10)))
            .await
            .expect("run ends with its window")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(31));
        assert!(stats.sent >= 10);
        assert!(stats.sent < 30);
        assert_eq!(stats.sent, stats.ok + stats.fail);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_wait_gives_up_at_the_deadline() {
        let mut limiter = RateLimiter::new(0.0);
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(!launch_slot(&mut limiter, deadline).await);
        assert!(Instant::now() >= deadline);

        let mut limiter = RateLimiter::new(5.0);
        assert!(launch_slot(&mut limiter, Instant::now() + Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_too_small_is_fatal() {
        let client = FakeIngest {
            fail_every: 0,
            latency: Duration::ZERO,
        };
        let err = runner(client, 3, 1000.0).run(shape(4)).await.unwrap_err();
        assert!(matches!(err, HarnessError::PoolTooSmall { .. }));
    }
}
