use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{BudgetAction, BudgetConfig, PerTaskLimits};
use crate::provider::{day_window, month_window, UsageProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertScope {
    Daily,
    Monthly,
}

impl AlertScope {
    fn as_str(self) -> &'static str {
        match self {
            AlertScope::Daily => "daily",
            AlertScope::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Warning,
    Exceeded,
}

impl AlertKind {
    fn as_str(self) -> &'static str {
        match self {
            AlertKind::Warning => "warning",
            AlertKind::Exceeded => "exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetAlert {
    pub scope: AlertScope,
    pub kind: AlertKind,
    pub spent_usd: f64,
    pub limit_usd: f64,
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub action: BudgetAction,
    pub reason: Option<String>,
    /// `None` = no limit configured for the window.
    pub daily_left: Option<f64>,
    pub monthly_left: Option<f64>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            action: BudgetAction::None,
            reason: None,
            daily_left: None,
            monthly_left: None,
        }
    }
}

type AlertCallback = Box<dyn Fn(BudgetAlert) + Send + Sync>;

struct EnforcerState {
    paused: bool,
    pause_reason: Option<String>,
    /// Whether the active pause was caused by a daily breach; the daily
    /// roll only auto-resumes those.
    paused_by_daily: bool,
    blocked_tasks: u64,
    /// `"daily:warning:2026-08-01"`-style keys so each alert fires once per
    /// window per kind.
    fired_alerts: HashSet<String>,
}

/// Process-wide admission gate shared by all pollers.
pub struct BudgetEnforcer {
    config: BudgetConfig,
    provider: Arc<dyn UsageProvider>,
    state: Mutex<EnforcerState>,
    callbacks: Mutex<Vec<AlertCallback>>,
}

impl BudgetEnforcer {
    pub fn new(config: BudgetConfig, provider: Arc<dyn UsageProvider>) -> Self {
        Self {
            config,
            provider,
            state: Mutex::new(EnforcerState {
                paused: false,
                pause_reason: None,
                paused_by_daily: false,
                blocked_tasks: 0,
                fired_alerts: HashSet::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn per_task_limits(&self) -> PerTaskLimits {
        self.config.per_task
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn blocked_count(&self) -> u64 {
        self.state.lock().blocked_tasks
    }

    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        state.paused = true;
        state.pause_reason = Some(reason.clone());
        drop(state);
        warn!("budget enforcer paused: {reason}");
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        state.pause_reason = None;
        state.paused_by_daily = false;
        drop(state);
        info!("budget enforcer resumed");
    }

    /// Called by the daily roll. Idempotent within a day: clears the blocked
    /// counter, forgets daily alerts, and auto-resumes a pause that was
    /// caused by a daily breach.
    pub fn reset_daily(&self) {
        let mut state = self.state.lock();
        state.blocked_tasks = 0;
        state.fired_alerts.retain(|k| !k.starts_with("daily:"));
        if state.paused && state.paused_by_daily {
            state.paused = false;
            state.pause_reason = None;
            state.paused_by_daily = false;
            drop(state);
            info!("budget enforcer auto-resumed by daily reset");
        }
    }

    pub fn on_alert(&self, cb: impl Fn(BudgetAlert) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(cb));
    }

    /// Admission check. Queries the provider for the daily window first,
    /// then the monthly window (providers may depend on that order), but
    /// evaluates monthly first because it is the more severe breach.
    pub async fn check_budget(&self) -> Decision {
        if !self.config.enabled {
            return Decision::allow();
        }

        {
            let mut state = self.state.lock();
            if state.paused {
                state.blocked_tasks += 1;
                return Decision {
                    allowed: false,
                    action: BudgetAction::Pause,
                    reason: state.pause_reason.clone(),
                    daily_left: None,
                    monthly_left: None,
                };
            }
        }

        let now = Local::now();
        let (day_start, day_end) = day_window(now);
        let (month_start, month_end) = month_window(now);

        // Daily window is always queried first; see trait docs.
        let daily = match self.provider.usage_since(day_start, day_end).await {
            Ok(w) => w,
            Err(e) => {
                warn!("budget provider error (daily window), failing open: {e:#}");
                return Decision::allow();
            }
        };
        let monthly = match self.provider.usage_since(month_start, month_end).await {
            Ok(w) => w,
            Err(e) => {
                warn!("budget provider error (monthly window), failing open: {e:#}");
                return Decision::allow();
            }
        };

        let daily_left = self
            .config
            .daily_limit_usd
            .map(|limit| (limit - daily.cost_usd).max(0.0));
        let monthly_left = self
            .config
            .monthly_limit_usd
            .map(|limit| (limit - monthly.cost_usd).max(0.0));

        let mut alerts = Vec::new();
        let mut decision = Decision {
            allowed: true,
            action: BudgetAction::None,
            reason: None,
            daily_left,
            monthly_left,
        };

        {
            let mut state = self.state.lock();

            // Monthly first: the more severe window wins the decision.
            if let Some(limit) = self.config.monthly_limit_usd {
                self.evaluate_window(
                    &mut state,
                    &mut decision,
                    &mut alerts,
                    AlertScope::Monthly,
                    monthly.cost_usd,
                    limit,
                    self.config.on_exceed.monthly,
                    month_start,
                );
            }
            if decision.allowed {
                if let Some(limit) = self.config.daily_limit_usd {
                    self.evaluate_window(
                        &mut state,
                        &mut decision,
                        &mut alerts,
                        AlertScope::Daily,
                        daily.cost_usd,
                        limit,
                        self.config.on_exceed.daily,
                        day_start,
                    );
                }
            }

            if !decision.allowed {
                state.blocked_tasks += 1;
            }
        }

        // Callbacks run outside the lock so they may call back into the
        // enforcer.
        if !alerts.is_empty() {
            let callbacks = self.callbacks.lock();
            for alert in &alerts {
                for cb in callbacks.iter() {
                    cb(alert.clone());
                }
            }
        }

        decision
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_window(
        &self,
        state: &mut EnforcerState,
        decision: &mut Decision,
        alerts: &mut Vec<BudgetAlert>,
        scope: AlertScope,
        spent: f64,
        limit: f64,
        action: BudgetAction,
        window_start: DateTime<Utc>,
    ) {
        let warn_at = limit * self.config.warn_percent / 100.0;

        if spent >= limit {
            if fire_once(state, scope, AlertKind::Exceeded, window_start) {
                alerts.push(BudgetAlert {
                    scope,
                    kind: AlertKind::Exceeded,
                    spent_usd: spent,
                    limit_usd: limit,
                });
            }
            match action {
                BudgetAction::Stop => {
                    decision.allowed = false;
                    decision.action = BudgetAction::Stop;
                    decision.reason = Some(format!(
                        "{} budget exceeded: ${spent:.2} of ${limit:.2}",
                        scope.as_str()
                    ));
                }
                BudgetAction::Pause => {
                    decision.allowed = false;
                    decision.action = BudgetAction::Pause;
                    let reason = format!(
                        "{} budget exceeded: ${spent:.2} of ${limit:.2}",
                        scope.as_str()
                    );
                    decision.reason = Some(reason.clone());
                    state.paused = true;
                    state.pause_reason = Some(reason);
                    state.paused_by_daily = scope == AlertScope::Daily;
                }
                BudgetAction::Warn => {
                    warn!(
                        "{} budget exceeded (${spent:.2} of ${limit:.2}), continuing per config",
                        scope.as_str()
                    );
                    decision.action = BudgetAction::Warn;
                }
                BudgetAction::None => {}
            }
        } else if spent >= warn_at
            && fire_once(state, scope, AlertKind::Warning, window_start)
        {
            warn!(
                "{} budget at {:.0}%: ${spent:.2} of ${limit:.2}",
                scope.as_str(),
                spent / limit * 100.0
            );
            alerts.push(BudgetAlert {
                scope,
                kind: AlertKind::Warning,
                spent_usd: spent,
                limit_usd: limit,
            });
        }
    }
}

fn fire_once(
    state: &mut EnforcerState,
    scope: AlertScope,
    kind: AlertKind,
    window_start: DateTime<Utc>,
) -> bool {
    let key = format!(
        "{}:{}:{}",
        scope.as_str(),
        kind.as_str(),
        window_start.format("%Y-%m-%d")
    );
    state.fired_alerts.insert(key)
}
