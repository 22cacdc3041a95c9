use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which external tracker a task came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    Asana,
    AzureDevOps,
    Linear,
}

impl TrackerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackerKind::Asana => "asana",
            TrackerKind::AzureDevOps => "azure_devops",
            TrackerKind::Linear => "linear",
        }
    }

    /// Uppercase prefix used in display identifiers (`ASANA-1234567`).
    pub fn prefix(self) -> &'static str {
        match self {
            TrackerKind::Asana => "ASANA",
            TrackerKind::AzureDevOps => "AZDO",
            TrackerKind::Linear => "LINEAR",
        }
    }
}

impl std::fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tracker kind: {0}")]
pub struct UnknownTracker(pub String);

impl std::str::FromStr for TrackerKind {
    type Err = UnknownTracker;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asana" => Ok(TrackerKind::Asana),
            "azure_devops" | "azuredevops" | "azdo" => Ok(TrackerKind::AzureDevOps),
            "linear" => Ok(TrackerKind::Linear),
            other => Err(UnknownTracker(other.to_string())),
        }
    }
}

/// Stable task identity. Native ids are unique per tracker, not globally,
/// so every key in the core carries the pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub tracker: TrackerKind,
    pub native_id: String,
}

impl TaskId {
    pub fn new(tracker: TrackerKind, native_id: impl Into<String>) -> Self {
        Self {
            tracker,
            native_id: native_id.into(),
        }
    }

    /// Key used by the processed store: `asana:1234567`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.tracker.as_str(), self.native_id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.tracker.prefix(), self.native_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
    #[default]
    None,
}

/// A unit of work discovered in an external tracker, normalized into the
/// core's internal form. `raw` keeps the tracker's own payload for callback
/// use (adapters need native fields the normalized view drops).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub permalink: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

impl Task {
    /// Case-insensitive label lookup. Trackers differ on label casing and
    /// users retype tags by hand, so exact matching loses tasks.
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(name))
    }
}

/// Durable outcome recorded in the processed store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Processed,
    Failed,
}

/// What the executor hands back when it finishes a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: Option<String>,
    pub pr_url: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
}
