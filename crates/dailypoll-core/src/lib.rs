//! `dailypoll-core` — shared configuration and constants for the dailypoll
//! backend crates.

pub mod config;
pub mod error;

pub use config::{DailypollConfig, DatabaseConfig, SchedulerConfig};
pub use error::{CoreError, Result};
