//! The simulation device pool.
//!
//! Fetched once before the first run and shared read-only afterwards; every
//! level draws its devices from the front of the same snapshot.

use crate::error::HarnessError;
use crate::tracker::{RemoteDevice, TrackerClient};
use tracing::info;

pub const DEFAULT_PREFIX: &str = "SIM";

#[derive(Debug, Clone)]
pub struct DevicePool {
    prefix: String,
    devices: Vec<RemoteDevice>,
}

impl DevicePool {
    /// Keeps only devices whose unique id starts with `prefix`.
    pub fn from_devices(all: Vec<RemoteDevice>, prefix: &str) -> Result<Self, HarnessError> {
        let devices: Vec<RemoteDevice> = all
            .into_iter()
            .filter(|d| d.unique_id.starts_with(prefix))
            .collect();
        if devices.is_empty() {
            return Err(HarnessError::EmptyPool {
                prefix: prefix.to_string(),
            });
        }
        Ok(Self {
            prefix: prefix.to_string(),
            devices,
        })
    }

    pub async fn fetch(tracker: &TrackerClient, prefix: &str) -> Result<Self, HarnessError> {
        let pool = Self::from_devices(tracker.list_devices().await?, prefix)?;
        info!("Caching {} {} devices", pool.len(), pool.prefix);
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The first `count` devices; an error when the pool is too small.
    pub fn take(&self, count: usize) -> Result<&[RemoteDevice], HarnessError> {
        self.devices
            .get(..count)
            .ok_or(HarnessError::PoolTooSmall {
                requested: count,
                available: self.devices.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: i64, unique_id: &str) -> RemoteDevice {
        RemoteDevice {
            id,
            name: unique_id.to_string(),
            unique_id: unique_id.to_string(),
        }
    }

    #[test]
    fn filters_by_prefix_and_keeps_order() {
        let pool = DevicePool::from_devices(
            vec![
                device(1, "SIMU00001"),
                device(2, "bus-7"),
                device(3, "SIMU00002"),
            ],
            DEFAULT_PREFIX,
        )
        .unwrap();
        assert_eq!(pool.len(), 2);
        assert!(!pool.is_empty());
        let ids: Vec<i64> = pool.take(2).unwrap().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn empty_pool_is_an_error() {
        let err = DevicePool::from_devices(vec![device(1, "bus-7")], DEFAULT_PREFIX).unwrap_err();
        assert!(matches!(err, HarnessError::EmptyPool { .. }));
    }

    #[test]
    fn taking_more_than_available_fails() {
        let pool = DevicePool::from_devices(vec![device(1, "SIM1")], DEFAULT_PREFIX).unwrap();
        assert!(pool.take(1).is_ok());
        let err = pool.take(2).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::PoolTooSmall {
                requested: 2,
                available: 1
            }
        ));
    }
}
