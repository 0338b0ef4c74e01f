use anyhow::{Context, Result};
use clap::Parser;
use fleet_ramp::config::{Cli, Command, RampArgs, RegisterArgs, RunArgs, SummarizeArgs, TargetArgs};
use fleet_ramp::executor::HttpIngestClient;
use fleet_ramp::pool::DevicePool;
use fleet_ramp::ramp::RampController;
use fleet_ramp::registration::register_missing;
use fleet_ramp::report::ReportSink;
use fleet_ramp::summary;
use fleet_ramp::swarm::{log_run_summary, SwarmRunner, SwarmSettings};
use fleet_ramp::telemetry::TelemetryCollector;
use fleet_ramp::tracker::TrackerClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Listing a large fleet can take a while.
const TRACKER_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Ramp(args) => ramp(args).await,
        Command::Register(args) => register(args).await,
        Command::Summarize(args) => summarize(args),
    }
}

// =============================================================================
// Setup
// =============================================================================

/// Fetches the device pool once and wires the swarm against the ingest target.
async fn build_swarm(
    target: &TargetArgs,
    settings: SwarmSettings,
) -> Result<SwarmRunner<HttpIngestClient>> {
    let api_key = target.api_key()?;
    let tracker = TrackerClient::new(&target.base_url, api_key, TRACKER_TIMEOUT)
        .context("Failed to create tracking API client")?;
    let pool = DevicePool::fetch(&tracker, &target.id_prefix)
        .await
        .context("Failed to fetch simulation devices")?;

    let client = HttpIngestClient::new(target.ingest_base(), target.insecure)
        .context("Failed to create ingest client")?;

    let telemetry = TelemetryCollector::new(&target.do_api_url, target.telemetry_credentials())
        .context("Failed to create telemetry client")?;
    if !telemetry.is_enabled() {
        warn!("DO_API_KEY or DO_DROPLET_ID not set, host metrics will be reported as nan");
    }

    Ok(SwarmRunner::new(client, Arc::new(pool), telemetry, settings))
}

// =============================================================================
// Commands
// =============================================================================

async fn run(args: RunArgs) -> Result<()> {
    let shape = args.shape()?;
    let settings = args.swarm.settings()?;
    let interval = settings.interval;

    info!("════════════════════════════════════════════════════════════");
    info!("           DEVICE SWARM RUN");
    info!("════════════════════════════════════════════════════════════");
    info!("Ingest: {}", args.target.ingest_base());
    info!("Devices: {}", shape.devices);
    info!("Interval: {}s", interval.as_secs());
    info!("Duration: {}s", shape.duration.as_secs());
    info!("Concurrency: {}", shape.concurrency);
    info!("Launch rate: {:.0}/s", settings.launch_rate);
    info!("════════════════════════════════════════════════════════════");

    let runner = build_swarm(&args.target, settings).await?;
    let stats = runner.run(shape).await.context("Swarm run failed")?;
    log_run_summary(shape, interval, &stats);
    Ok(())
}

async fn ramp(args: RampArgs) -> Result<()> {
    let ramp_settings = args.settings()?;
    let swarm_settings = args.swarm.settings()?;

    info!("════════════════════════════════════════════════════════════");
    info!("           DEVICE SWARM RAMP");
    info!("════════════════════════════════════════════════════════════");
    info!("Ingest: {}", args.target.ingest_base());
    info!(
        "Devices: start={} step={} max={}",
        ramp_settings.devices_start, ramp_settings.devices_step, ramp_settings.max_devices
    );
    info!(
        "Concurrency: start={} step={} max={}",
        ramp_settings.concurrency_start,
        ramp_settings.concurrency_step,
        ramp_settings.max_concurrency
    );
    info!(
        "Duration per level: {}s, Interval: {}s",
        ramp_settings.duration_per_level.as_secs(),
        ramp_settings.interval.as_secs()
    );
    info!(
        "Failure threshold: {}, Min OK: {}",
        ramp_settings.failure_threshold, ramp_settings.min_ok
    );
    info!("Report: {}", args.csv.display());
    info!("════════════════════════════════════════════════════════════");

    let mut sink = ReportSink::open(&args.csv)
        .with_context(|| format!("Failed to open report {}", args.csv.display()))?;
    let runner = build_swarm(&args.target, swarm_settings).await?;
    let controller = RampController::new(runner, ramp_settings);
    let outcome = controller.run(&mut sink).await.context("Ramp failed")?;

    info!("Levels completed: {}", outcome.levels.len());
    match outcome.stop {
        Some(reason) => info!("Stop reason: {}", reason),
        None => info!("Stop reason: reached configured maximum"),
    }
    Ok(())
}

async fn register(args: RegisterArgs) -> Result<()> {
    let tracker = TrackerClient::new(&args.base_url, &args.api_key, TRACKER_TIMEOUT)
        .context("Failed to create tracking API client")?;
    let summary = register_missing(&tracker, args.device_limit)
        .await
        .context("Device registration failed")?;
    if summary.created < summary.requested {
        warn!(
            "{} devices could not be created",
            summary.requested - summary.created
        );
    }
    Ok(())
}

fn summarize(args: SummarizeArgs) -> Result<()> {
    let tiers = summary::load_tiers(&args.reports)
        .with_context(|| format!("Failed to read reports under {}", args.reports.display()))?;
    if tiers.is_empty() {
        warn!("No droplet_<tier>_reports directories with data found");
        return Ok(());
    }
    println!("{}", summary::render(&tiers));
    Ok(())
}
