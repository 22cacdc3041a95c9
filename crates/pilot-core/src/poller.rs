//! Per-tracker polling engine: discovery, orphan recovery, admission, and
//! semaphore-bounded dispatch.
//!
//! Lifecycle: load processed history → cache tags → recover orphans →
//! initial poll → ticker loop → drain. At-most-once dispatch rests on
//! mark-before-dispatch: a task is recorded processed (in memory and in the
//! durable store) before a slot is even requested, so a second tick firing
//! mid-scan cannot double-dispatch it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use pilot_budget::{BudgetEnforcer, TaskLimiter};
use pilot_trackers::TrackerApi;
use pilot_types::{StatusTag, StatusTagNames, Task, TaskId, TaskOutcome};

use crate::handler::TaskHandler;
use crate::notify::Notifier;
use crate::status::StatusTagMachine;
use crate::store::{ProcessedStore, StoreError};

/// Stale in-progress sweeps: a task bearing the in-progress tag with no
/// active worker in this process is stripped once it has been observed
/// inactive for `threshold`.
#[derive(Debug, Clone)]
pub struct StaleCleanup {
    pub interval: Duration,
    pub threshold: Duration,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub trigger_tag: String,
    pub poll_interval: Duration,
    /// Values below 1 are coerced to 1.
    pub max_concurrent: i64,
    pub status_tags: StatusTagNames,
    /// Also mark the task completed on the tracker after `done` is applied.
    pub complete_on_done: bool,
    pub cleanup: Option<StaleCleanup>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            trigger_tag: "pilot".to_string(),
            poll_interval: Duration::from_secs(30),
            max_concurrent: 2,
            status_tags: StatusTagNames::default(),
            complete_on_done: false,
            cleanup: None,
        }
    }
}

struct DispatchState {
    stopping: bool,
}

pub struct Poller {
    tracker: Arc<dyn TrackerApi>,
    handler: Option<Arc<dyn TaskHandler>>,
    store: Arc<dyn ProcessedStore>,
    budget: Arc<BudgetEnforcer>,
    notifier: Arc<Notifier>,
    status: StatusTagMachine,
    config: PollerConfig,
    max_concurrent: usize,
    /// In-memory mirror of the processed store, authoritative for this
    /// process. Read-mostly.
    processed: RwLock<HashSet<String>>,
    semaphore: Arc<Semaphore>,
    workers: TaskTracker,
    /// Serializes the stop-guard with `drain`'s stopping write so a worker
    /// spawned concurrently with shutdown can never be missed by the wait.
    dispatch: Mutex<DispatchState>,
    /// Native ids with a live worker; consulted by the stale-tag sweep.
    active_ids: Arc<parking_lot::Mutex<HashSet<String>>>,
}

impl Poller {
    pub fn new(
        tracker: Arc<dyn TrackerApi>,
        handler: Option<Arc<dyn TaskHandler>>,
        store: Arc<dyn ProcessedStore>,
        budget: Arc<BudgetEnforcer>,
        config: PollerConfig,
    ) -> Self {
        let max_concurrent = effective_concurrency(config.max_concurrent);
        let notifier = Arc::new(Notifier::new(tracker.clone(), config.trigger_tag.clone()));
        Self {
            status: StatusTagMachine::new(config.status_tags.clone()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            workers: TaskTracker::new(),
            dispatch: Mutex::new(DispatchState { stopping: false }),
            processed: RwLock::new(HashSet::new()),
            active_ids: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            max_concurrent,
            tracker,
            handler,
            store,
            budget,
            notifier,
            config,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    /// Run the full lifecycle until `cancel` fires, then drain and return.
    pub async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.prepare().await?;
        self.spawn_cleanup_loop(cancel.clone());

        self.poll_once(&cancel).await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the initial poll already ran
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_once(&cancel).await,
            }
        }

        info!("{}: draining", self.tracker.kind());
        self.drain().await;
        Ok(())
    }

    /// Load processed history, resolve tags, recover orphans. The trigger
    /// tag must exist — an agent polling a tag nobody can apply is
    /// misconfigured, and silently creating it would hide the typo.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        if let Err(e) = self.tracker.ping().await {
            // Transient unreachability heals on later ticks; real auth
            // problems resurface as fatal errors from the tag lookup below.
            warn!("{}: ping failed: {e}", self.tracker.kind());
        }

        let known = self
            .store
            .load_all(self.tracker.kind())
            .await
            .context("loading processed store")?;
        {
            let mut processed = self.processed.write().await;
            for id in known.keys() {
                processed.insert(id.clone());
            }
        }
        info!(
            "{}: loaded {} processed task ids",
            self.tracker.kind(),
            known.len()
        );

        let trigger = &self.config.trigger_tag;
        match self.tracker.lookup_tag(trigger).await {
            Ok(Some(_)) => {}
            Ok(None) => anyhow::bail!(
                "trigger tag '{trigger}' does not exist on {}",
                self.tracker.kind()
            ),
            Err(e) => {
                return Err(anyhow::Error::from(e)).context("resolving trigger tag");
            }
        }
        for tag in StatusTag::ALL {
            let name = self.status.name_of(tag).to_string();
            if let Err(e) = self.tracker.ensure_tag(&name).await {
                warn!("could not ensure status tag '{name}': {e}; lifecycle reflection degraded");
            }
        }

        self.recover_orphans().await;
        Ok(())
    }

    /// Strip `in-progress` from tasks left behind by a previous run so they
    /// are re-discovered. Only the tag is cleared — a task is retried only
    /// when its processed flag is also cleared through the user-visible
    /// retry workflow.
    pub async fn recover_orphans(&self) {
        let in_progress = self.status.names().in_progress.clone();
        let orphans = match self.tracker.list_by_status_tag(&in_progress).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("{}: orphan listing failed: {e}", self.tracker.kind());
                return;
            }
        };
        if orphans.is_empty() {
            debug!("{}: no orphaned tasks", self.tracker.kind());
            return;
        }
        for task in orphans {
            match self.tracker.remove_status_tag(&task.id, &in_progress).await {
                Ok(()) => info!("recovered orphaned task {}; it will be re-discovered", task.id),
                Err(e) => warn!("could not recover orphan {}: {e}", task.id),
            }
        }
    }

    /// One discovery tick: list, filter, admit, dispatch.
    pub async fn poll_once(&self, cancel: &CancellationToken) {
        let mut tasks = match self.tracker.list_candidates(&self.config.trigger_tag).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(
                    "{}: candidate listing failed ({}retryable): {e}",
                    self.tracker.kind(),
                    if e.retryable() { "" } else { "not " }
                );
                return;
            }
        };
        // Oldest first: FIFO fairness within a tick.
        tasks.sort_by_key(|t| t.created_at);

        for task in tasks {
            if cancel.is_cancelled() {
                return;
            }
            if self.processed.read().await.contains(&task.id.native_id) {
                continue;
            }
            if self.status.has_status_tag(&task) {
                debug!(
                    "skipping {}: lifecycle tag {:?} present",
                    task.id,
                    self.status.status_of(&task)
                );
                continue;
            }

            let decision = self.budget.check_budget().await;
            if !decision.allowed {
                // The task stays unmarked so it re-qualifies once budget
                // allows again.
                warn!(
                    "budget denied admission ({:?}): {}",
                    decision.action,
                    decision.reason.as_deref().unwrap_or("paused")
                );
                return;
            }

            self.mark_processed(&task.id).await;

            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            let dispatch = self.dispatch.lock().await;
            if dispatch.stopping || cancel.is_cancelled() {
                // The task stays processed in memory; it will not be
                // duplicated on restart of the loop.
                drop(permit);
                return;
            }
            self.spawn_worker(task, permit, cancel.clone());
            drop(dispatch);
        }
    }

    fn spawn_worker(&self, task: Task, permit: OwnedSemaphorePermit, cancel: CancellationToken) {
        let tracker = self.tracker.clone();
        let handler = self.handler.clone();
        let store = self.store.clone();
        let budget = self.budget.clone();
        let notifier = self.notifier.clone();
        let status = self.status.clone();
        let complete_on_done = self.config.complete_on_done;
        let active_ids = self.active_ids.clone();

        self.workers.spawn(async move {
            let _permit = permit;
            active_ids.lock().insert(task.id.native_id.clone());
            run_worker(
                &task,
                tracker,
                handler,
                store,
                budget,
                notifier,
                status,
                complete_on_done,
                cancel,
            )
            .await;
            active_ids.lock().remove(&task.id.native_id);
        });
    }

    async fn mark_processed(&self, id: &TaskId) {
        self.processed.write().await.insert(id.native_id.clone());
        if let Err(e) = self
            .store
            .mark(id.tracker, &id.native_id, TaskOutcome::Processed)
            .await
        {
            warn!("durable mark for {id} failed: {e}; in-memory flag remains authoritative");
        }
    }

    fn spawn_cleanup_loop(&self, cancel: CancellationToken) {
        let Some(settings) = self.config.cleanup.clone() else {
            return;
        };
        let tracker = self.tracker.clone();
        let in_progress = self.status.names().in_progress.clone();
        let active_ids = self.active_ids.clone();

        tokio::spawn(async move {
            let mut seen: HashMap<String, Instant> = HashMap::new();
            let mut ticker = tokio::time::interval(settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                sweep_stale_tags(
                    tracker.as_ref(),
                    &in_progress,
                    &active_ids,
                    &mut seen,
                    settings.threshold,
                )
                .await;
            }
        });
    }

    /// Stop accepting new work and wait for in-flight workers to finish.
    pub async fn drain(&self) {
        {
            let mut dispatch = self.dispatch.lock().await;
            dispatch.stopping = true;
        }
        self.workers.close();
        self.workers.wait().await;
    }

    /// Test-side synchronization: identical semantics to [`Poller::drain`].
    pub async fn wait_for_active(&self) {
        self.drain().await;
    }

    pub async fn is_processed(&self, id: &TaskId) -> bool {
        self.processed.read().await.contains(&id.native_id)
    }

    /// Forget a task in memory and in the store — the retry workflow after
    /// a user removes the `failed` tag.
    pub async fn clear_processed(&self, id: &TaskId) -> Result<(), StoreError> {
        self.processed.write().await.remove(&id.native_id);
        self.store.unmark(id.tracker, &id.native_id).await
    }

    pub async fn processed_count(&self) -> usize {
        self.processed.read().await.len()
    }

    /// Clear the in-memory mirror and re-arm dispatch after a drain. The
    /// durable store is left untouched.
    pub async fn reset(&self) {
        self.processed.write().await.clear();
        self.workers.reopen();
        self.dispatch.lock().await.stopping = false;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    task: &Task,
    tracker: Arc<dyn TrackerApi>,
    handler: Option<Arc<dyn TaskHandler>>,
    store: Arc<dyn ProcessedStore>,
    budget: Arc<BudgetEnforcer>,
    notifier: Arc<Notifier>,
    status: StatusTagMachine,
    complete_on_done: bool,
    cancel: CancellationToken,
) {
    let Some(handler) = handler else {
        debug!("no task handler configured; releasing {}", task.id);
        return;
    };

    let in_progress = status.name_of(StatusTag::InProgress).to_string();
    if let Err(e) = tracker.add_status_tag(&task.id, &in_progress).await {
        warn!("could not apply in-progress to {}: {e}", task.id);
    }
    notifier.task_started(task).await;

    let limiter = Arc::new(TaskLimiter::new(budget.per_task_limits()));
    let task_cancel = limiter.deadline_token(&cancel);
    let outcome = handler.handle(task, limiter.clone(), task_cancel).await;

    // Tag operations from here on are best-effort: the tracker may be
    // flaky and the local outcome is already persisted.
    if let Err(e) = tracker.remove_status_tag(&task.id, &in_progress).await {
        warn!("could not remove in-progress from {}: {e}", task.id);
    }

    match outcome {
        Ok(result) => {
            if let Err(e) = tracker
                .add_status_tag(&task.id, status.name_of(StatusTag::Done))
                .await
            {
                warn!("could not apply done to {}: {e}", task.id);
            }
            if complete_on_done {
                if let Err(e) = tracker.mark_completed(&task.id).await {
                    warn!("could not mark {} completed: {e}", task.id);
                }
            }
            notifier.task_completed(task, &result).await;
            info!("task {} completed", task.id);
        }
        Err(e) => {
            if let Err(te) = tracker
                .add_status_tag(&task.id, status.name_of(StatusTag::Failed))
                .await
            {
                warn!("could not apply failed to {}: {te}", task.id);
            }
            if let Err(se) = store
                .mark(task.id.tracker, &task.id.native_id, TaskOutcome::Failed)
                .await
            {
                warn!("could not record failed outcome for {}: {se}", task.id);
            }
            notifier.task_failed(task, &format!("{e:#}")).await;
            warn!("task {} failed: {e:#}", task.id);
        }
    }
}

fn effective_concurrency(configured: i64) -> usize {
    configured.max(1) as usize
}

async fn sweep_stale_tags(
    tracker: &dyn TrackerApi,
    in_progress: &str,
    active_ids: &Arc<parking_lot::Mutex<HashSet<String>>>,
    seen: &mut HashMap<String, Instant>,
    threshold: Duration,
) {
    let tagged = match tracker.list_by_status_tag(in_progress).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!("stale-tag sweep failed: {e}");
            return;
        }
    };

    let active = active_ids.lock().clone();
    let now = Instant::now();
    let mut inactive: HashSet<String> = HashSet::new();

    for task in tagged {
        if active.contains(&task.id.native_id) {
            continue;
        }
        inactive.insert(task.id.native_id.clone());
        let first_seen = *seen
            .entry(task.id.native_id.clone())
            .or_insert(now);
        if now.duration_since(first_seen) >= threshold {
            match tracker.remove_status_tag(&task.id, in_progress).await {
                Ok(()) => {
                    info!("cleared stale in-progress tag on {}", task.id);
                    seen.remove(&task.id.native_id);
                }
                Err(e) => warn!("could not clear stale tag on {}: {e}", task.id),
            }
        }
    }

    // Tasks that became active or lost the tag since last sweep drop out.
    seen.retain(|id, _| inactive.contains(id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_conventions() {
        let config = PollerConfig::default();
        assert_eq!(config.trigger_tag, "pilot");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent, 2);
        assert!(!config.complete_on_done);
        assert!(config.cleanup.is_none());
    }

    #[test]
    fn non_positive_concurrency_coerces_to_one() {
        assert_eq!(effective_concurrency(0), 1);
        assert_eq!(effective_concurrency(-5), 1);
        assert_eq!(effective_concurrency(4), 4);
    }
}
