use serde::{Deserialize, Serialize};

/// The three lifecycle labels Pilot writes to the tracker. At most one
/// should be present on a task; `Done` is terminal, `Failed` is retryable
/// once the user removes the tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusTag {
    InProgress,
    Done,
    Failed,
}

impl StatusTag {
    pub const ALL: [StatusTag; 3] = [StatusTag::InProgress, StatusTag::Done, StatusTag::Failed];
}

/// Configurable tag names. The roles are fixed; only the strings vary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusTagNames {
    #[serde(default = "default_in_progress")]
    pub in_progress: String,
    #[serde(default = "default_done")]
    pub done: String,
    #[serde(default = "default_failed")]
    pub failed: String,
}

fn default_in_progress() -> String {
    "pilot-in-progress".to_string()
}

fn default_done() -> String {
    "pilot-done".to_string()
}

fn default_failed() -> String {
    "pilot-failed".to_string()
}

impl Default for StatusTagNames {
    fn default() -> Self {
        Self {
            in_progress: default_in_progress(),
            done: default_done(),
            failed: default_failed(),
        }
    }
}

impl StatusTagNames {
    pub fn name_of(&self, tag: StatusTag) -> &str {
        match tag {
            StatusTag::InProgress => &self.in_progress,
            StatusTag::Done => &self.done,
            StatusTag::Failed => &self.failed,
        }
    }

    /// Reverse lookup, case-insensitive.
    pub fn tag_of(&self, name: &str) -> Option<StatusTag> {
        StatusTag::ALL
            .into_iter()
            .find(|t| self.name_of(*t).eq_ignore_ascii_case(name))
    }
}
