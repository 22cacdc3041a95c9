//! Issue tracker integrations for Pilot.
//!
//! Each adapter implements the [`TrackerApi`] capability set over its
//! tracker's native wire protocol. Adapters own authentication, pagination,
//! and tag-identifier caching; the core only ever sees normalized
//! [`pilot_types::Task`] values and tracker-private tag strings.

pub mod asana;
pub mod azure_devops;
pub mod error;
pub mod linear;
pub mod traits;

pub use asana::{AsanaConfig, AsanaTracker};
pub use azure_devops::{AzureDevOpsConfig, AzureDevOpsTracker};
pub use error::{Result, TrackerError};
pub use linear::{LinearConfig, LinearTracker};
pub use traits::TrackerApi;
