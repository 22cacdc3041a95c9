//! Pilot configuration.
//!
//! Loaded in priority order: environment variables > `config.json` in the
//! state dir. `PilotConfig::load` returns `Err` only for unreadable or
//! malformed files and when *no* tracker ends up configured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use pilot_budget::BudgetConfig;
use pilot_trackers::{AsanaConfig, AzureDevOpsConfig, LinearConfig};
use pilot_types::StatusTagNames;

use crate::poller::{PollerConfig, StaleCleanup};

fn default_true() -> bool {
    true
}

fn default_trigger() -> String {
    "pilot".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_cleanup_threshold")]
    pub threshold_secs: u64,
}

fn default_cleanup_interval() -> u64 {
    30 * 60
}

fn default_cleanup_threshold() -> u64 {
    60 * 60
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_cleanup_interval(),
            threshold_secs: default_cleanup_threshold(),
        }
    }
}

/// Settings shared by every tracker entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerCommon {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_trigger")]
    pub trigger_tag: String,
    #[serde(default)]
    pub status_tags: StatusTagNames,
    #[serde(default)]
    pub polling: PollConfig,
    /// Dispatch slots; values below 1 are coerced to 1. Default 2.
    #[serde(default)]
    pub max_concurrent: Option<i64>,
    #[serde(default)]
    pub complete_on_done: bool,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl Default for TrackerCommon {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_tag: default_trigger(),
            status_tags: StatusTagNames::default(),
            polling: PollConfig::default(),
            max_concurrent: None,
            complete_on_done: false,
            cleanup: CleanupConfig::default(),
        }
    }
}

impl TrackerCommon {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            trigger_tag: self.trigger_tag.clone(),
            poll_interval: Duration::from_secs(self.interval_secs_or_default()),
            max_concurrent: self.max_concurrent.unwrap_or(2),
            status_tags: self.status_tags.clone(),
            complete_on_done: self.complete_on_done,
            cleanup: self.cleanup.enabled.then(|| StaleCleanup {
                interval: Duration::from_secs(self.cleanup.interval_secs),
                threshold: Duration::from_secs(self.cleanup.threshold_secs),
            }),
        }
    }

    fn interval_secs_or_default(&self) -> u64 {
        if self.polling.interval_secs == 0 {
            default_poll_interval()
        } else {
            self.polling.interval_secs
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsanaEntry {
    #[serde(flatten)]
    pub common: TrackerCommon,
    #[serde(flatten)]
    pub api: AsanaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureDevOpsEntry {
    #[serde(flatten)]
    pub common: TrackerCommon,
    #[serde(flatten)]
    pub api: AzureDevOpsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearEntry {
    #[serde(flatten)]
    pub common: TrackerCommon,
    #[serde(flatten)]
    pub api: LinearConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackersConfig {
    #[serde(default)]
    pub asana: Option<AsanaEntry>,
    #[serde(default)]
    pub azure_devops: Option<AzureDevOpsEntry>,
    #[serde(default)]
    pub linear: Option<LinearEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PilotConfig {
    #[serde(default)]
    pub trackers: TrackersConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

/// Flag > `PILOT_STATE_DIR` > `.pilot`.
pub fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = std::env::var("PILOT_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".pilot")
}

/// Comma-separated list with per-item trimming.
pub fn parse_type_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl PilotConfig {
    /// Read `config.json` from the state dir (when present), then let
    /// `PILOT_*` environment variables add or replace whole tracker
    /// entries. Fails when no tracker is configured at the end.
    pub fn load(state_dir: &Path) -> anyhow::Result<Self> {
        let path = state_dir.join("config.json");
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<PilotConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            PilotConfig::default()
        };

        if let Some(asana) = Self::asana_from_env() {
            config.trackers.asana = Some(asana);
        }
        if let Some(azdo) = Self::azure_devops_from_env() {
            config.trackers.azure_devops = Some(azdo);
        }
        if let Some(linear) = Self::linear_from_env() {
            config.trackers.linear = Some(linear);
        }

        if config.enabled_tracker_count() == 0 {
            bail!(
                "no trackers configured — add one to {} or set at least one of: \
                PILOT_ASANA_ACCESS_TOKEN, PILOT_AZDO_PAT, PILOT_LINEAR_API_KEY",
                path.display()
            );
        }

        Ok(config)
    }

    pub fn enabled_tracker_count(&self) -> usize {
        [
            self.trackers.asana.as_ref().map(|t| t.common.enabled),
            self.trackers
                .azure_devops
                .as_ref()
                .map(|t| t.common.enabled),
            self.trackers.linear.as_ref().map(|t| t.common.enabled),
        ]
        .into_iter()
        .flatten()
        .filter(|enabled| *enabled)
        .count()
    }

    fn asana_from_env() -> Option<AsanaEntry> {
        let access_token = non_empty_env("PILOT_ASANA_ACCESS_TOKEN")?;
        let workspace_gid = non_empty_env("PILOT_ASANA_WORKSPACE_GID")?;
        Some(AsanaEntry {
            common: TrackerCommon::default(),
            api: AsanaConfig {
                access_token,
                workspace_gid,
                project_gid: non_empty_env("PILOT_ASANA_PROJECT_GID"),
            },
        })
    }

    fn azure_devops_from_env() -> Option<AzureDevOpsEntry> {
        let pat = non_empty_env("PILOT_AZDO_PAT")?;
        let organization = non_empty_env("PILOT_AZDO_ORGANIZATION")?;
        let project = non_empty_env("PILOT_AZDO_PROJECT")?;
        Some(AzureDevOpsEntry {
            common: TrackerCommon::default(),
            api: AzureDevOpsConfig {
                organization,
                project,
                pat,
                work_item_types: non_empty_env("PILOT_AZDO_WORK_ITEM_TYPES")
                    .map(|raw| parse_type_list(&raw))
                    .unwrap_or_default(),
            },
        })
    }

    fn linear_from_env() -> Option<LinearEntry> {
        let api_key = non_empty_env("PILOT_LINEAR_API_KEY")?;
        Some(LinearEntry {
            common: TrackerCommon::default(),
            api: LinearConfig {
                api_key,
                team_id: non_empty_env("PILOT_LINEAR_TEAM_ID"),
            },
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_tracker_entry() {
        let config: PilotConfig = serde_json::from_str(
            r#"{
                "trackers": {
                    "asana": {
                        "access_token": "pat-123",
                        "workspace_gid": "ws-1",
                        "trigger_tag": "autopilot",
                        "polling": { "interval_secs": 10 },
                        "max_concurrent": 4,
                        "cleanup": { "enabled": true }
                    }
                },
                "budget": { "enabled": true, "daily_limit_usd": 25.0 }
            }"#,
        )
        .unwrap();

        let asana = config.trackers.asana.unwrap();
        assert_eq!(asana.api.access_token, "pat-123");
        assert_eq!(asana.common.trigger_tag, "autopilot");
        assert_eq!(asana.common.polling.interval_secs, 10);

        let poller = asana.common.poller_config();
        assert_eq!(poller.poll_interval, Duration::from_secs(10));
        assert_eq!(poller.max_concurrent, 4);
        let cleanup = poller.cleanup.unwrap();
        assert_eq!(cleanup.interval, Duration::from_secs(30 * 60));
        assert_eq!(cleanup.threshold, Duration::from_secs(60 * 60));
    }

    #[test]
    fn tracker_defaults() {
        let config: PilotConfig = serde_json::from_str(
            r#"{ "trackers": { "linear": { "api_key": "lin-1" } } }"#,
        )
        .unwrap();
        let linear = config.trackers.linear.unwrap();
        assert!(linear.common.enabled);
        assert_eq!(linear.common.trigger_tag, "pilot");

        let poller = linear.common.poller_config();
        assert_eq!(poller.poll_interval, Duration::from_secs(30));
        assert_eq!(poller.max_concurrent, 2);
        assert!(poller.cleanup.is_none());
    }

    #[test]
    fn zero_poll_interval_falls_back_to_default() {
        let mut common = TrackerCommon::default();
        common.polling.interval_secs = 0;
        assert_eq!(
            common.poller_config().poll_interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn enabled_count_ignores_disabled_entries() {
        let config: PilotConfig = serde_json::from_str(
            r#"{
                "trackers": {
                    "linear": { "api_key": "k", "enabled": false },
                    "azure_devops": { "organization": "o", "project": "p", "pat": "x" }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.enabled_tracker_count(), 1);
    }

    #[test]
    fn parse_type_list_trims_and_drops_empty() {
        assert_eq!(parse_type_list("Task, Bug ,"), vec!["Task", "Bug"]);
        assert_eq!(parse_type_list(""), Vec::<String>::new());
    }

    #[test]
    fn resolve_state_dir_prefers_flag() {
        assert_eq!(
            resolve_state_dir(Some(PathBuf::from("/tmp/pilot"))),
            PathBuf::from("/tmp/pilot")
        );
    }

    #[test]
    fn load_fails_with_no_trackers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = PilotConfig::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no trackers configured"));
    }

    #[test]
    fn load_reads_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{ "trackers": { "linear": { "api_key": "lin-1" } } }"#,
        )
        .unwrap();
        let config = PilotConfig::load(tmp.path()).unwrap();
        assert!(config.trackers.linear.is_some());
        assert_eq!(config.enabled_tracker_count(), 1);
    }
}
