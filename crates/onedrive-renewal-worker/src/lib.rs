//! Background worker that keeps OneDrive change subscriptions from lapsing.

pub mod config;
pub mod renewal;
pub mod storage;
pub mod telemetry;

pub use config::{ConfigError, WorkerConfig};
pub use renewal::{RenewalError, RenewalJob, TickOutcome, TickReport, spawn_renewal_worker};
