//! Registers simulation devices on the tracking server up to a target count.

use crate::error::HarnessError;
use crate::tracker::{CreateOutcome, TrackerClient};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub const NAME_PREFIX: &str = "SIMU";
const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const NAME_DIGITS: u32 = 5;
const MAX_IN_FLIGHT: usize = 1000;
const ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSummary {
    pub existing: usize,
    pub requested: usize,
    pub created: usize,
}

/// `SIMU` followed by `n` in base 36, least significant digit first.
pub fn device_name(n: u64) -> String {
    let mut name = String::with_capacity(NAME_PREFIX.len() + NAME_DIGITS as usize);
    name.push_str(NAME_PREFIX);
    for j in 0..NAME_DIGITS {
        let digit = (n / 36u64.pow(j)) % 36;
        name.push(ALPHABET[digit as usize] as char);
    }
    name
}

/// Up to `count` fresh names, skipping any in `existing`.
pub fn generate_names(count: usize, existing: &HashSet<String>) -> Vec<String> {
    let space = 36u64.pow(NAME_DIGITS);
    (0..space)
        .map(device_name)
        .filter(|name| !existing.contains(name))
        .take(count)
        .collect()
}

/// Tops the server up to `limit` devices.
pub async fn register_missing(
    tracker: &TrackerClient,
    limit: usize,
) -> Result<RegistrationSummary, HarnessError> {
    let existing: HashSet<String> = tracker
        .list_devices()
        .await?
        .into_iter()
        .map(|d| d.name)
        .collect();
    info!("Total existing devices: {}", existing.len());

    if existing.len() >= limit {
        info!(
            "Device limit reached ({}/{}). No new devices will be created.",
            existing.len(),
            limit
        );
        return Ok(RegistrationSummary {
            existing: existing.len(),
            requested: 0,
            created: 0,
        });
    }

    let names = generate_names(limit - existing.len(), &existing);
    info!("Generated {} device names", names.len());

    let started = Instant::now();
    let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    let creations = names.iter().map(|name| {
        let permits = Arc::clone(&permits);
        async move { create_with_retry(tracker, &permits, name).await }
    });
    let created = futures_util::future::join_all(creations)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

    info!(
        "Created {}/{} devices in {:.1}s",
        created,
        names.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(RegistrationSummary {
        existing: existing.len(),
        requested: names.len(),
        created,
    })
}

async fn create_with_retry(tracker: &TrackerClient, permits: &Semaphore, name: &str) -> bool {
    for attempt in 1..=ATTEMPTS {
        let result = match permits.acquire().await {
            Ok(_permit) => tracker.create_device(name).await,
            Err(_) => return false,
        };
        match result {
            Ok(CreateOutcome::Created(_)) => return true,
            Ok(CreateOutcome::Refused { status, body }) => {
                debug!("[{}] {} attempt {}: {}", status, name, attempt, body);
            }
            Err(e) => {
                warn!("{} attempt {}: {}", name, attempt, e);
                sleep(Duration::from_millis(500) * attempt).await;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_base36_little_endian() {
        assert_eq!(device_name(0), "SIMU00000");
        assert_eq!(device_name(1), "SIMU10000");
        assert_eq!(device_name(35), "SIMUZ0000");
        assert_eq!(device_name(36), "SIMU01000");
    }

    #[test]
    fn generated_names_skip_existing_and_are_unique() {
        let existing: HashSet<String> = ["SIMU00000", "SIMU20000"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let names = generate_names(4, &existing);
        assert_eq!(names, vec!["SIMU10000", "SIMU30000", "SIMU40000", "SIMU50000"]);

        let many = generate_names(2_000, &HashSet::new());
        let unique: HashSet<&String> = many.iter().collect();
        assert_eq!(unique.len(), 2_000);
        assert!(many.iter().all(|n| n.starts_with(NAME_PREFIX) && n.len() == 9));
    }
}
