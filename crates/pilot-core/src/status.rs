use pilot_types::{StatusTag, StatusTagNames, Task};

/// Tracker-agnostic lifecycle predicate over the three status tags.
///
/// The state machine lives on the tracker itself: the subset of
/// `{in-progress, done, failed}` present on a task. Any status tag makes a
/// task non-eligible; if a task somehow carries both `done` and `failed`,
/// terminal wins and it is skipped.
#[derive(Debug, Clone)]
pub struct StatusTagMachine {
    names: StatusTagNames,
}

impl StatusTagMachine {
    pub fn new(names: StatusTagNames) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &StatusTagNames {
        &self.names
    }

    pub fn name_of(&self, tag: StatusTag) -> &str {
        self.names.name_of(tag)
    }

    /// Any lifecycle tag present, case-insensitive.
    pub fn has_status_tag(&self, task: &Task) -> bool {
        task.labels.iter().any(|l| self.names.tag_of(l).is_some())
    }

    /// The first status tag found, in `in-progress`, `done`, `failed` order.
    pub fn status_of(&self, task: &Task) -> Option<StatusTag> {
        StatusTag::ALL
            .into_iter()
            .find(|tag| task.has_label(self.names.name_of(*tag)))
    }

    /// `done` alone marks a task permanently processed; `failed` is
    /// retryable once the user removes it.
    pub fn is_terminal(&self, task: &Task) -> bool {
        task.has_label(&self.names.done)
    }
}

impl Default for StatusTagMachine {
    fn default() -> Self {
        Self::new(StatusTagNames::default())
    }
}
