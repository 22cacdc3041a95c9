use async_trait::async_trait;
use pilot_types::{Task, TaskId, TrackerKind};

use crate::error::Result;

/// Uniform capability set over issue trackers.
///
/// Cancellation is drop-based: callers race these futures against a
/// cancellation token, and every in-flight HTTP request is additionally
/// bounded by the adapter's 30-second client timeout.
///
/// Tag identifiers may be opaque (Asana GIDs, Linear label UUIDs). Adapters
/// resolve and cache them on first use; the core only ever passes tag
/// *names*.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    fn kind(&self) -> TrackerKind;

    /// Tasks bearing the trigger tag and not in a terminal tracker state.
    /// Completed/closed items are filtered out adapter-side, so the core's
    /// only terminal predicate is the status-tag machine.
    async fn list_candidates(&self, trigger_tag: &str) -> Result<Vec<Task>>;

    /// Tasks currently bearing the given status tag. Used by orphan recovery
    /// and stale-tag cleanup.
    async fn list_by_status_tag(&self, tag_name: &str) -> Result<Vec<Task>>;

    /// Resolve a tag name to its tracker-private identifier without creating
    /// it. `Ok(None)` means the tag does not exist.
    async fn lookup_tag(&self, name: &str) -> Result<Option<String>>;

    /// Resolve a tag name, creating the tag when the tracker supports it.
    async fn ensure_tag(&self, name: &str) -> Result<String>;

    /// Idempotent per `(id, tag)`: adding a tag the task already carries is
    /// a no-op that does not error.
    async fn add_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()>;

    /// Removing a tag absent from the task is a no-op.
    async fn remove_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()>;

    /// Append-only comment. Failures never block the pipeline; callers log
    /// and continue.
    async fn post_comment(&self, id: &TaskId, body: &str) -> Result<()>;

    /// Best-effort link attachment. Callers fall back to a plain comment on
    /// failure.
    async fn attach_link(&self, id: &TaskId, url: &str, name: &str) -> Result<()>;

    /// Mark the task completed in the tracker. Optional; adapters without a
    /// safe mapping return [`crate::TrackerError::Unsupported`].
    async fn mark_completed(&self, id: &TaskId) -> Result<()>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;
}
