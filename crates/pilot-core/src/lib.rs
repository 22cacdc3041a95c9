//! Task intake and dispatch core for Pilot.
//!
//! Turns heterogeneous issue trackers into a uniform, restart-safe,
//! budget-gated stream of in-progress work. One [`Poller`] runs per tracker;
//! the processed store and budget enforcer are process-wide singletons.

pub mod config;
pub mod handler;
pub mod notify;
pub mod poller;
pub mod status;
pub mod store;

pub use config::{CleanupConfig, PilotConfig, PollConfig, TrackersConfig};
pub use handler::TaskHandler;
pub use notify::Notifier;
pub use poller::{Poller, PollerConfig};
pub use status::StatusTagMachine;
pub use store::{FileProcessedStore, ProcessedRecord, ProcessedStore, StoreError};
