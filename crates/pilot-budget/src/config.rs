use serde::{Deserialize, Serialize};

/// What admission does when a window limit is breached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    #[default]
    None,
    Warn,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OnExceed {
    #[serde(default = "default_daily_action")]
    pub daily: BudgetAction,
    #[serde(default = "default_monthly_action")]
    pub monthly: BudgetAction,
}

fn default_daily_action() -> BudgetAction {
    BudgetAction::Pause
}

fn default_monthly_action() -> BudgetAction {
    BudgetAction::Stop
}

impl Default for OnExceed {
    fn default() -> Self {
        Self {
            daily: default_daily_action(),
            monthly: default_monthly_action(),
        }
    }
}

/// Caps applied to each individual task. Zero means no cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PerTaskLimits {
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `None` = unlimited.
    #[serde(default)]
    pub daily_limit_usd: Option<f64>,
    #[serde(default)]
    pub monthly_limit_usd: Option<f64>,
    #[serde(default)]
    pub per_task: PerTaskLimits,
    #[serde(default)]
    pub on_exceed: OnExceed,
    /// Percentage of a window limit at which a warning alert fires.
    #[serde(default = "default_warn_percent")]
    pub warn_percent: f64,
}

fn default_warn_percent() -> f64 {
    80.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_limit_usd: None,
            monthly_limit_usd: None,
            per_task: PerTaskLimits::default(),
            on_exceed: OnExceed::default(),
            warn_percent: default_warn_percent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_disabled_and_unlimited() {
        let config = BudgetConfig::default();
        assert!(!config.enabled);
        assert!(config.daily_limit_usd.is_none());
        assert_eq!(config.per_task.max_tokens, 0);
        assert_eq!(config.warn_percent, 80.0);
    }

    #[test]
    fn parse_full_config() {
        let config: BudgetConfig = serde_json::from_str(
            r#"{
                "enabled": true,
                "daily_limit_usd": 50.0,
                "monthly_limit_usd": 500.0,
                "per_task": { "max_tokens": 200000, "max_duration_secs": 1800 },
                "on_exceed": { "daily": "stop", "monthly": "stop" },
                "warn_percent": 90.0
            }"#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.daily_limit_usd, Some(50.0));
        assert_eq!(config.on_exceed.daily, BudgetAction::Stop);
        assert_eq!(config.per_task.max_duration_secs, 1800);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: BudgetConfig = serde_json::from_str(r#"{ "enabled": true }"#).unwrap();
        assert_eq!(config.on_exceed.daily, BudgetAction::Pause);
        assert_eq!(config.on_exceed.monthly, BudgetAction::Stop);
    }
}
