use crate::device::SimulationArea;
use crate::error::HarnessError;
use crate::pool::DEFAULT_PREFIX;
use crate::ramp::RampSettings;
use crate::swarm::{LoadShape, SwarmSettings};
use crate::telemetry::{DropletCredentials, DEFAULT_API_URL};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Command line
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "fleet-ramp")]
#[command(about = "Synthetic GPS device swarm and ramp load generator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a single fixed-duration swarm and print a summary
    Run(RunArgs),
    /// Escalate load level by level until a stop condition is hit
    Ramp(RampArgs),
    /// Create simulation devices on the tracking server up to a limit
    Register(RegisterArgs),
    /// Summarize collected ramp reports into capacity tables
    Summarize(SummarizeArgs),
}

/// Where the load goes and where host metrics come from.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Tracking server API base URL
    #[arg(long, env = "TRACCAR_BASE_URL")]
    pub base_url: String,

    /// Position ingest base URL (defaults to the API base)
    #[arg(long, env = "TRACCAR_INGEST_URL")]
    pub ingest_url: Option<String>,

    /// Tracking server API key
    #[arg(long, env = "TRACCAR_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Monitoring API key
    #[arg(long, env = "DO_API_KEY", hide_env_values = true)]
    pub do_api_key: Option<String>,

    /// Monitored host id
    #[arg(long, env = "DO_DROPLET_ID")]
    pub droplet_id: Option<String>,

    /// Monitoring API base URL
    #[arg(long, env = "DO_API_URL", default_value = DEFAULT_API_URL)]
    pub do_api_url: String,

    /// Disable TLS verification (for testing)
    #[arg(long)]
    pub insecure: bool,

    /// Unique-id prefix of the simulation devices
    #[arg(long, default_value = DEFAULT_PREFIX)]
    pub id_prefix: String,
}

impl TargetArgs {
    pub fn ingest_base(&self) -> &str {
        self.ingest_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn api_key(&self) -> Result<&str, HarnessError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(HarnessError::MissingSetting("TRACCAR_API_KEY"))
    }

    /// Host telemetry is enabled only when both the key and the host id are set.
    pub fn telemetry_credentials(&self) -> Option<DropletCredentials> {
        let api_key = self.do_api_key.as_deref().filter(|k| !k.is_empty())?;
        let droplet_id = self.droplet_id.as_deref().filter(|d| !d.is_empty())?;
        Some(DropletCredentials {
            api_key: api_key.to_string(),
            droplet_id: droplet_id.to_string(),
        })
    }
}

/// Swarm behaviour shared by single runs and ramps.
#[derive(Args, Debug, Clone)]
pub struct SwarmArgs {
    /// Seconds between messages per device
    #[arg(long, default_value = "30")]
    pub interval: u64,

    /// New devices per second at startup
    #[arg(long, default_value = "1000")]
    pub launch_rate: f64,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Print sample failure details periodically
    #[arg(long)]
    pub debug: bool,

    /// Max failure samples kept per progress interval
    #[arg(long, default_value = "5")]
    pub print_failures: usize,

    /// Show top status codes in progress lines
    #[arg(long)]
    pub status_summary: bool,

    /// Seconds between progress lines
    #[arg(long, default_value = "10")]
    pub progress_interval: u64,

    /// Latitude the devices start around
    #[arg(long, default_value = "10.3157", allow_negative_numbers = true)]
    pub center_lat: f64,

    /// Longitude the devices start around
    #[arg(long, default_value = "123.8854", allow_negative_numbers = true)]
    pub center_lon: f64,
}

impl SwarmArgs {
    pub fn settings(&self) -> Result<SwarmSettings, HarnessError> {
        positive("interval", self.interval)?;
        positive("progress-interval", self.progress_interval)?;
        if !(self.launch_rate.is_finite() && self.launch_rate > 0.0) {
            return Err(HarnessError::invalid("launch-rate", "must be a positive number"));
        }
        if !(-90.0..=90.0).contains(&self.center_lat) {
            return Err(HarnessError::invalid("center-lat", "must be within [-90, 90]"));
        }
        if !(-180.0..=180.0).contains(&self.center_lon) {
            return Err(HarnessError::invalid("center-lon", "must be within [-180, 180]"));
        }

        Ok(SwarmSettings {
            interval: Duration::from_secs(self.interval),
            launch_rate: self.launch_rate,
            seed: self.seed,
            area: SimulationArea {
                center_lat: self.center_lat,
                center_lon: self.center_lon,
                ..SimulationArea::default()
            },
            progress_interval: Duration::from_secs(self.progress_interval),
            failure_sample_cap: self.print_failures,
            status_summary: self.status_summary,
            show_failures: self.debug,
            ..SwarmSettings::default()
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub swarm: SwarmArgs,

    #[arg(long, default_value = "30000")]
    pub devices: usize,

    /// Total run time in seconds
    #[arg(long, default_value = "30")]
    pub duration: u64,

    /// Max requests in flight
    #[arg(long, default_value = "1000")]
    pub concurrency: usize,
}

impl RunArgs {
    pub fn shape(&self) -> Result<LoadShape, HarnessError> {
        positive("devices", self.devices as u64)?;
        positive("duration", self.duration)?;
        positive("concurrency", self.concurrency as u64)?;
        Ok(LoadShape {
            devices: self.devices,
            concurrency: self.concurrency,
            duration: Duration::from_secs(self.duration),
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct RampArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub swarm: SwarmArgs,

    #[arg(long, default_value = "10000")]
    pub devices_start: usize,

    /// Devices added per level
    #[arg(long, default_value = "0")]
    pub devices_step: usize,

    #[arg(long, default_value = "30000")]
    pub max_devices: usize,

    #[arg(long, default_value = "1000")]
    pub concurrency_start: usize,

    /// Concurrency added per level
    #[arg(long, default_value = "0")]
    pub concurrency_step: usize,

    #[arg(long, default_value = "10000")]
    pub max_concurrency: usize,

    /// Seconds per level
    #[arg(long, default_value = "30")]
    pub duration_per_level: u64,

    /// Fail ratio above this stops the ramp
    #[arg(long, default_value = "0.5")]
    pub failure_threshold: f64,

    /// Minimum OK responses required to continue
    #[arg(long, default_value = "10")]
    pub min_ok: u64,

    /// CSV report output path
    #[arg(long, default_value = "ramp_report.csv")]
    pub csv: PathBuf,
}

impl RampArgs {
    pub fn settings(&self) -> Result<RampSettings, HarnessError> {
        positive("devices-start", self.devices_start as u64)?;
        positive("concurrency-start", self.concurrency_start as u64)?;
        positive("duration-per-level", self.duration_per_level)?;
        positive("interval", self.swarm.interval)?;
        if !(self.failure_threshold.is_finite() && self.failure_threshold >= 0.0) {
            return Err(HarnessError::invalid(
                "failure-threshold",
                "must be a non-negative number",
            ));
        }

        Ok(RampSettings {
            devices_start: self.devices_start,
            devices_step: self.devices_step,
            max_devices: self.max_devices,
            concurrency_start: self.concurrency_start,
            concurrency_step: self.concurrency_step,
            max_concurrency: self.max_concurrency,
            duration_per_level: Duration::from_secs(self.duration_per_level),
            interval: Duration::from_secs(self.swarm.interval),
            failure_threshold: self.failure_threshold,
            min_ok: self.min_ok,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct RegisterArgs {
    /// Tracking server API base URL
    #[arg(long, env = "TRACCAR_BASE_URL")]
    pub base_url: String,

    /// Tracking server API key
    #[arg(long, env = "TRACCAR_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Total devices the server should end up with
    #[arg(long, default_value = "100100")]
    pub device_limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SummarizeArgs {
    /// Directory holding droplet_<tier>_reports folders
    #[arg(long, default_value = "reports")]
    pub reports: PathBuf,
}

fn positive(name: &'static str, value: u64) -> Result<(), HarnessError> {
    if value == 0 {
        return Err(HarnessError::invalid(name, "must be greater than zero"));
    }
    Ok(())
}
