//! Synthetic GPS device swarm for load-testing a position-ingest endpoint,
//! with a ramp controller that escalates load until the target degrades.

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod pool;
pub mod ramp;
pub mod rate_limiter;
pub mod registration;
pub mod report;
pub mod stats;
pub mod summary;
pub mod swarm;
pub mod telemetry;
pub mod tracker;

pub use error::HarnessError;
