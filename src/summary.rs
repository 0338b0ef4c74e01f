//! Capacity summary across collected ramp reports.
//!
//! Reports are grouped by host tier: every `*.csv` inside a
//! `droplet_<tier>_reports` directory belongs to `<tier>`.

use crate::error::HarnessError;
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::Path;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::warn;

const STABLE_FAIL_RATIO: f64 = 0.05;
const DEGRADED_FAIL_RATIO: f64 = 0.10;

/// The columns of a ramp report the summary needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportRow {
    pub devices: u64,
    pub fail_ratio: f64,
    pub cpu_percent: f64,
    pub load_1m: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub rps_ok_avg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierHardware {
    pub tier: &'static str,
    pub vcpu: u32,
    pub ram_gb: u32,
    pub monthly_cost: f64,
    pub cpu_type: &'static str,
}

pub const TIER_HARDWARE: [TierHardware; 7] = [
    TierHardware { tier: "6USD", vcpu: 1, ram_gb: 1, monthly_cost: 6.0, cpu_type: "Regular" },
    TierHardware { tier: "8USD", vcpu: 1, ram_gb: 1, monthly_cost: 8.0, cpu_type: "Premium Intel" },
    TierHardware { tier: "12USD", vcpu: 1, ram_gb: 2, monthly_cost: 12.0, cpu_type: "Regular" },
    TierHardware { tier: "16USD", vcpu: 1, ram_gb: 2, monthly_cost: 16.0, cpu_type: "Premium Intel" },
    TierHardware { tier: "18USD", vcpu: 2, ram_gb: 2, monthly_cost: 18.0, cpu_type: "Regular" },
    TierHardware { tier: "24USD", vcpu: 2, ram_gb: 4, monthly_cost: 24.0, cpu_type: "Regular" },
    TierHardware { tier: "48USD", vcpu: 4, ram_gb: 8, monthly_cost: 48.0, cpu_type: "Regular" },
];

pub fn tier_hardware(tier: &str) -> Option<TierHardware> {
    TIER_HARDWARE.iter().find(|s| s.tier == tier).copied()
}

/// Largest finite value; NaN cells are skipped.
fn finite_max(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.filter(|v| v.is_finite()).reduce(f64::max)
}

/// Mean of the finite values; `None` if there are none.
fn finite_mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TierAnalysis {
    pub tier: String,
    pub hardware: Option<TierHardware>,
    pub total_tests: usize,
    pub min_devices: u64,
    pub max_devices: u64,
    pub max_fail_ratio: Option<f64>,
    pub max_cpu_percent: Option<f64>,
    pub max_load_1m: Option<f64>,
    pub max_p99_ms: Option<f64>,
    /// Most devices served with at most 5% failures.
    pub stable_capacity: u64,
    /// Most devices served with at most 10% failures.
    pub degradation_threshold: u64,
    pub avg_stable_cpu: Option<f64>,
    pub avg_stable_p50: Option<f64>,
    pub avg_stable_p99: Option<f64>,
    pub avg_stable_rps: Option<f64>,
}

impl TierAnalysis {
    pub fn from_rows(tier: &str, rows: &[ReportRow]) -> Option<Self> {
        let min_devices = rows.iter().map(|r| r.devices).min()?;
        let max_devices = rows.iter().map(|r| r.devices).max()?;

        let capacity_at = |limit: f64| {
            rows.iter()
                .filter(|r| r.fail_ratio <= limit)
                .map(|r| r.devices)
                .max()
        };
        let stable_capacity = capacity_at(STABLE_FAIL_RATIO).unwrap_or(min_devices);
        let degradation_threshold = capacity_at(DEGRADED_FAIL_RATIO).unwrap_or(stable_capacity);

        let stable: Vec<&ReportRow> = rows
            .iter()
            .filter(|r| r.devices <= stable_capacity && r.fail_ratio <= STABLE_FAIL_RATIO)
            .collect();

        Some(Self {
            tier: tier.to_string(),
            hardware: tier_hardware(tier),
            total_tests: rows.len(),
            min_devices,
            max_devices,
            max_fail_ratio: finite_max(rows.iter().map(|r| r.fail_ratio)),
            max_cpu_percent: finite_max(rows.iter().map(|r| r.cpu_percent)),
            max_load_1m: finite_max(rows.iter().map(|r| r.load_1m)),
            max_p99_ms: finite_max(rows.iter().map(|r| r.p99_ms)),
            stable_capacity,
            degradation_threshold,
            avg_stable_cpu: finite_mean(stable.iter().map(|r| r.cpu_percent)),
            avg_stable_p50: finite_mean(stable.iter().map(|r| r.p50_ms)),
            avg_stable_p99: finite_mean(stable.iter().map(|r| r.p99_ms)),
            avg_stable_rps: finite_mean(stable.iter().map(|r| r.rps_ok_avg)),
        })
    }

    pub fn cost_per_1k_devices(&self) -> Option<f64> {
        let hardware = self.hardware?;
        (self.stable_capacity > 0).then(|| hardware.monthly_cost / (self.stable_capacity as f64 / 1000.0))
    }

    pub fn devices_per_dollar(&self) -> Option<f64> {
        let hardware = self.hardware?;
        Some(self.stable_capacity as f64 / hardware.monthly_cost)
    }
}

// =============================================================================
// Loading
// =============================================================================

pub fn read_rows(path: &Path) -> Result<Vec<ReportRow>, HarnessError> {
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<ReportRow>, _>>()?;
    Ok(rows)
}

fn tier_name(dir_name: &str) -> Option<&str> {
    dir_name
        .strip_prefix("droplet_")?
        .strip_suffix("_reports")
        .filter(|t| !t.is_empty())
}

/// Analyses every tier directory under `root`, sorted by directory name.
pub fn load_tiers(root: &Path) -> Result<Vec<TierAnalysis>, HarnessError> {
    let mut dirs: Vec<_> = std::fs::read_dir(root)?
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .collect();
    dirs.sort_by_key(|e| e.file_name());

    let mut tiers = Vec::new();
    for dir in dirs {
        let dir_name = dir.file_name().to_string_lossy().into_owned();
        let Some(tier) = tier_name(&dir_name) else {
            continue;
        };

        let mut files: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        files.sort();

        let mut rows = Vec::new();
        for file in files {
            match read_rows(&file) {
                Ok(mut r) => rows.append(&mut r),
                Err(e) => warn!("Could not read {}: {}", file.display(), e),
            }
        }
        if let Some(analysis) = TierAnalysis::from_rows(tier, &rows) {
            tiers.push(analysis);
        }
    }
    Ok(tiers)
}

// =============================================================================
// Rendering
// =============================================================================

fn opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.precision$}"))
}

#[derive(Tabled)]
struct CapacityRow {
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Cost/Mo")]
    cost: String,
    #[tabled(rename = "vCPU")]
    vcpu: String,
    #[tabled(rename = "RAM (GB)")]
    ram: String,
    #[tabled(rename = "CPU Type")]
    cpu_type: String,
    #[tabled(rename = "Stable Capacity")]
    stable: u64,
    #[tabled(rename = "Degradation Threshold")]
    degraded: u64,
    #[tabled(rename = "Cost per 1k Devices")]
    cost_per_1k: String,
}

#[derive(Tabled)]
struct StableLoadRow {
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Avg CPU (%)")]
    cpu: String,
    #[tabled(rename = "Avg P50 Latency (ms)")]
    p50: String,
    #[tabled(rename = "Avg P99 Latency (ms)")]
    p99: String,
    #[tabled(rename = "Avg RPS")]
    rps: String,
    #[tabled(rename = "Max Load Tested")]
    max_devices: u64,
}

#[derive(Tabled)]
struct LimitsRow {
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Max Fail Ratio")]
    fail_ratio: String,
    #[tabled(rename = "Max CPU (%)")]
    cpu: String,
    #[tabled(rename = "Max Load Average")]
    load: String,
    #[tabled(rename = "Max P99 Latency (ms)")]
    p99: String,
}

fn markdown<T: Tabled>(rows: Vec<T>) -> String {
    let mut table = Table::new(rows);
    table.with(Style::markdown());
    table.to_string()
}

fn mean_capacity<'a>(tiers: impl Iterator<Item = &'a TierAnalysis>) -> Option<f64> {
    finite_mean(tiers.map(|t| t.stable_capacity as f64))
}

/// Markdown tables plus a few derived observations.
pub fn render(tiers: &[TierAnalysis]) -> String {
    let hardware_field = |t: &TierAnalysis, f: fn(&TierHardware) -> String| {
        t.hardware.as_ref().map_or_else(|| "-".to_string(), f)
    };

    let capacity: Vec<CapacityRow> = tiers
        .iter()
        .map(|t| CapacityRow {
            tier: format!("${}", t.tier),
            cost: hardware_field(t, |s| format!("${}", s.monthly_cost)),
            vcpu: hardware_field(t, |s| s.vcpu.to_string()),
            ram: hardware_field(t, |s| s.ram_gb.to_string()),
            cpu_type: hardware_field(t, |s| s.cpu_type.to_string()),
            stable: t.stable_capacity,
            degraded: t.degradation_threshold,
            cost_per_1k: t
                .cost_per_1k_devices()
                .map_or_else(|| "-".to_string(), |c| format!("${c:.2}")),
        })
        .collect();

    let stable: Vec<StableLoadRow> = tiers
        .iter()
        .map(|t| StableLoadRow {
            tier: format!("${}", t.tier),
            cpu: opt(t.avg_stable_cpu, 1),
            p50: opt(t.avg_stable_p50, 1),
            p99: opt(t.avg_stable_p99, 1),
            rps: opt(t.avg_stable_rps, 0),
            max_devices: t.max_devices,
        })
        .collect();

    let limits: Vec<LimitsRow> = tiers
        .iter()
        .map(|t| LimitsRow {
            tier: format!("${}", t.tier),
            fail_ratio: opt(t.max_fail_ratio, 3),
            cpu: opt(t.max_cpu_percent, 1),
            load: opt(t.max_load_1m, 2),
            p99: opt(t.max_p99_ms, 0),
        })
        .collect();

    let mut out = String::new();
    let _ = writeln!(out, "# Performance Analysis Summary Tables\n");
    let _ = writeln!(out, "## Droplet Configuration and Capacity Summary\n");
    let _ = writeln!(out, "{}\n", markdown(capacity));
    let _ = writeln!(out, "## Performance Metrics at Stable Load\n");
    let _ = writeln!(out, "{}\n", markdown(stable));
    let _ = writeln!(out, "## System Limits and Failure Characteristics\n");
    let _ = writeln!(out, "{}\n", markdown(limits));
    let _ = writeln!(out, "## Key Observations\n");
    for line in observations(tiers) {
        let _ = writeln!(out, "- {line}");
    }
    out
}

pub fn observations(tiers: &[TierAnalysis]) -> Vec<String> {
    let mut lines = Vec::new();

    let best = tiers
        .iter()
        .filter_map(|t| t.devices_per_dollar().map(|d| (t, d)))
        .max_by(|a, b| a.1.total_cmp(&b.1));
    if let Some((tier, per_dollar)) = best {
        lines.push(format!(
            "**Most Cost-Effective Tier**: ${} provides {:.0} devices per dollar",
            tier.tier, per_dollar
        ));
    }

    let with_ram = |gb: u32| {
        mean_capacity(
            tiers
                .iter()
                .filter(move |t| t.hardware.is_some_and(|s| s.ram_gb == gb)),
        )
    };
    if let (Some(one), Some(two)) = (with_ram(1), with_ram(2)) {
        if one > 0.0 {
            lines.push(format!(
                "**Memory Impact**: 2GB RAM provides {:.1}x capacity improvement over 1GB",
                two / one
            ));
        }
    }

    let with_cpus = |n: u32| {
        mean_capacity(
            tiers
                .iter()
                .filter(move |t| t.hardware.is_some_and(|s| s.vcpu == n)),
        )
    };
    let (single, dual, quad) = (with_cpus(1), with_cpus(2), with_cpus(4));
    if let (Some(single), Some(dual)) = (single, dual) {
        if single > 0.0 {
            lines.push(format!(
                "**CPU Scaling**: Dual CPU provides {:.1}x capacity improvement",
                dual / single
            ));
        }
    }
    if let (Some(dual), Some(quad)) = (dual, quad) {
        if dual > 0.0 {
            lines.push(format!(
                "**High-End Scaling**: Quad CPU provides {:.1}x capacity over dual CPU",
                quad / dual
            ));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(devices: u64, fail_ratio: f64, cpu: f64) -> ReportRow {
        ReportRow {
            devices,
            fail_ratio,
            cpu_percent: cpu,
            load_1m: 1.0,
            p50_ms: 10.0,
            p99_ms: 100.0,
            rps_ok_avg: devices as f64 / 30.0,
        }
    }

    #[test]
    fn capacity_thresholds() {
        let rows = vec![
            row(1_000, 0.0, 20.0),
            row(2_000, 0.04, 40.0),
            row(3_000, 0.08, f64::NAN),
            row(4_000, 0.6, 99.0),
        ];
        let t = TierAnalysis::from_rows("18USD", &rows).unwrap();
        assert_eq!(t.stable_capacity, 2_000);
        assert_eq!(t.degradation_threshold, 3_000);
        assert_eq!(t.avg_stable_cpu, Some(30.0));
        assert_eq!(t.max_cpu_percent, Some(99.0));
        assert_eq!(t.max_fail_ratio, Some(0.6));
        assert_eq!(t.cost_per_1k_devices(), Some(9.0));
    }

    #[test]
    fn overloaded_tier_falls_back_to_minimum() {
        let rows = vec![row(5_000, 0.7, 90.0), row(6_000, 0.9, 95.0)];
        let t = TierAnalysis::from_rows("unknown", &rows).unwrap();
        assert_eq!(t.stable_capacity, 5_000);
        assert_eq!(t.degradation_threshold, 5_000);
        assert_eq!(t.avg_stable_cpu, None);
        assert_eq!(t.cost_per_1k_devices(), None);
        assert!(TierAnalysis::from_rows("x", &[]).is_none());
    }

    #[test]
    fn loads_tier_directories_and_renders() {
        let dir = TempDir::new().unwrap();
        let tier_dir = dir.path().join("droplet_6USD_reports");
        std::fs::create_dir(&tier_dir).unwrap();
        std::fs::create_dir(dir.path().join("unrelated")).unwrap();
        std::fs::write(
            tier_dir.join("run1.csv"),
            "timestamp,level,devices,concurrency,duration,ok,fail,fail_ratio,rps_avg,rps_ok_avg,p50_ms,p90_ms,p99_ms,bandwidth_pub_out_kbps,bandwidth_pub_in_kbps,cpu_percent,memory_usage,load_1m,load_5m,load_15m,disk_usage_percent\n\
             2025-01-01 00:00:00,1,1000,100,30,1000,0,0.0000,33.33,33.33,12.0,20.0,40.0,nan,nan,nan,nan,nan,nan,nan,nan\n\
             2025-01-01 00:01:00,2,2000,100,30,1400,600,0.3000,66.67,46.67,80.0,200.0,900.0,nan,nan,70.0,nan,1.50,nan,nan,nan\n",
        )
        .unwrap();

        let tiers = load_tiers(dir.path()).unwrap();
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].tier, "6USD");
        assert_eq!(tiers[0].stable_capacity, 1_000);
        assert_eq!(tiers[0].max_cpu_percent, Some(70.0));

        let text = render(&tiers);
        assert!(text.contains("## Key Observations"));
        assert!(text.contains("| $6USD"));
        assert!(text.contains("Most Cost-Effective Tier"));
    }

    #[test]
    fn observations_compare_hardware() {
        let tier = |name: &str, capacity: u64| {
            TierAnalysis::from_rows(name, &[row(capacity, 0.0, 10.0)]).unwrap()
        };
        let tiers = vec![tier("6USD", 1_000), tier("12USD", 2_000), tier("18USD", 4_000), tier("48USD", 8_000)];
        let lines = observations(&tiers);
        assert!(lines[0].contains("$18USD"));
        assert!(lines.iter().any(|l| l.contains("Memory Impact") && l.contains("3.0x")));
        assert!(lines.iter().any(|l| l.contains("Dual CPU provides 2.7x")));
        assert!(lines.iter().any(|l| l.contains("Quad CPU provides 2.0x")));
    }
}
