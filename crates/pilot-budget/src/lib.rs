//! Spend admission control for Pilot.
//!
//! Two layers with different jobs: the [`BudgetEnforcer`] decides whether a
//! task may *start* (rolling daily/monthly windows against configured
//! limits), and the [`TaskLimiter`] decides when a running task must *stop*
//! (token and wall-clock caps). Both are fed from the same
//! [`BudgetConfig`].

pub mod config;
pub mod enforcer;
pub mod limiter;
pub mod provider;

pub use config::{BudgetAction, BudgetConfig, OnExceed, PerTaskLimits};
pub use enforcer::{AlertKind, AlertScope, BudgetAlert, BudgetEnforcer, Decision};
pub use limiter::{LimiterSnapshot, TaskLimiter};
pub use provider::{day_window, month_window, UsageLedger, UsageProvider, UsageWindow};
