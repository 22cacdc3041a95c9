use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::PerTaskLimits;

/// Live per-task counters and caps. Admission says "you may start"; the
/// limiter says "you must stop now". Constructed at dispatch, owned by the
/// worker, observed by the dispatcher through [`TaskLimiter::snapshot`].
pub struct TaskLimiter {
    max_tokens: u64,
    max_duration: Duration,
    started_at: Instant,
    tokens: AtomicU64,
    exceeded: Mutex<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct LimiterSnapshot {
    pub tokens_used: u64,
    pub elapsed: Duration,
    pub exceeded: Option<String>,
}

impl TaskLimiter {
    pub fn new(limits: PerTaskLimits) -> Self {
        Self {
            max_tokens: limits.max_tokens,
            max_duration: Duration::from_secs(limits.max_duration_secs),
            started_at: Instant::now(),
            tokens: AtomicU64::new(0),
            exceeded: Mutex::new(None),
        }
    }

    /// Add consumed tokens. Returns `false` once the running total exceeds
    /// the cap; the reason is recorded on the first breach only.
    pub fn add_tokens(&self, n: u64) -> bool {
        let total = self.tokens.fetch_add(n, Ordering::Relaxed) + n;
        if self.max_tokens == 0 || total <= self.max_tokens {
            return true;
        }
        self.record_exceeded(format!(
            "token cap exceeded: {total} > {}",
            self.max_tokens
        ));
        false
    }

    /// Returns `false` once wall-clock exceeds the duration cap.
    pub fn check_duration(&self) -> bool {
        if self.max_duration.is_zero() || self.started_at.elapsed() <= self.max_duration {
            return true;
        }
        self.record_exceeded(format!(
            "duration cap exceeded: {:?} > {:?}",
            self.started_at.elapsed(),
            self.max_duration
        ));
        false
    }

    /// A child token cancelled at `started_at + duration_cap`. With no cap
    /// configured this is just a clone of the parent.
    pub fn deadline_token(&self, parent: &CancellationToken) -> CancellationToken {
        if self.max_duration.is_zero() {
            return parent.clone();
        }
        let child = parent.child_token();
        let remaining = self.max_duration.saturating_sub(self.started_at.elapsed());
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        child
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn exceeded_reason(&self) -> Option<String> {
        self.exceeded.lock().clone()
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            tokens_used: self.tokens_used(),
            elapsed: self.started_at.elapsed(),
            exceeded: self.exceeded_reason(),
        }
    }

    fn record_exceeded(&self, reason: String) {
        let mut exceeded = self.exceeded.lock();
        if exceeded.is_none() {
            warn!("task limiter: {reason}");
            *exceeded = Some(reason);
        }
    }
}
