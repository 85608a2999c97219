mod config;
mod coordinator;
mod dual_writer;
mod file_lock;
mod local_store;
mod node;
mod provider;
mod pull;
mod transfer;

pub mod context;

pub use config::*;
pub use coordinator::*;
pub use dual_writer::*;
pub use file_lock::*;
pub use local_store::*;
pub use provider::*;
pub use transfer::*;

#[cfg(test)]
mod provider_tests;

use std::time::Duration;

/// Default ceiling for per-resource and cluster lock waits.
pub const DEFAULT_LOCK_WAIT_SECS: u64 = 600;

pub fn default_lock_wait() -> Duration {
    Duration::from_secs(DEFAULT_LOCK_WAIT_SECS)
}
