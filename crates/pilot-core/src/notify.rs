use std::sync::Arc;

use tracing::warn;

use pilot_trackers::TrackerApi;
use pilot_types::{Task, TaskId, TaskResult};

/// User-visible progress reporting on the tracker. Every call is
/// best-effort: the tracker may be flaky and the local outcome is already
/// persisted, so failures are logged and swallowed.
pub struct Notifier {
    tracker: Arc<dyn TrackerApi>,
    trigger_tag: String,
}

impl Notifier {
    pub fn new(tracker: Arc<dyn TrackerApi>, trigger_tag: impl Into<String>) -> Self {
        Self {
            tracker,
            trigger_tag: trigger_tag.into(),
        }
    }

    pub async fn task_started(&self, task: &Task) {
        let body = format!("🤖 Pilot picked up {} — working on it.", task.id);
        if let Err(e) = self.tracker.post_comment(&task.id, &body).await {
            warn!("notifier: start comment for {} failed: {e}", task.id);
        }
    }

    pub async fn task_completed(&self, task: &Task, result: &TaskResult) {
        let mut body = format!("✅ Pilot finished {}.", task.id);
        if let Some(ref summary) = result.summary {
            body.push_str(&format!("\n\n{summary}"));
        }
        if let Err(e) = self.tracker.post_comment(&task.id, &body).await {
            warn!("notifier: completion comment for {} failed: {e}", task.id);
        }
        if let Some(ref pr) = result.pr_url {
            self.link_pr(&task.id, pr).await;
        }
    }

    pub async fn task_failed(&self, task: &Task, error: &str) {
        let body = format!(
            "❌ Pilot could not finish {}: {error}\n\nRemove the failed tag to retry.",
            task.id
        );
        if let Err(e) = self.tracker.post_comment(&task.id, &body).await {
            warn!("notifier: failure comment for {} failed: {e}", task.id);
        }
    }

    /// Posts the PR as an attachment and as a comment. The comment goes out
    /// even when the attachment call fails, so the URL always lands
    /// somewhere visible.
    pub async fn link_pr(&self, id: &TaskId, url: &str) {
        if let Err(e) = self.tracker.attach_link(id, url, "Pull request").await {
            warn!("notifier: attachment for {id} failed: {e}");
        }
        if let Err(e) = self
            .tracker
            .post_comment(id, &format!("Pull request: {url}"))
            .await
        {
            warn!("notifier: PR comment for {id} failed: {e}");
        }
    }

    pub async fn add_trigger(&self, id: &TaskId) {
        if let Err(e) = self.tracker.add_status_tag(id, &self.trigger_tag).await {
            warn!("notifier: adding trigger tag to {id} failed: {e}");
        }
    }

    /// Missing tag on removal is not an error — adapters no-op on that.
    pub async fn remove_trigger(&self, id: &TaskId) {
        if let Err(e) = self.tracker.remove_status_tag(id, &self.trigger_tag).await {
            warn!("notifier: removing trigger tag from {id} failed: {e}");
        }
    }
}
