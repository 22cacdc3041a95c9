use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;

/// Aggregated spend over a `[start, end)` range.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageWindow {
    pub cost_usd: f64,
    pub tokens: u64,
    pub calls: u64,
}

/// Source of spend data for admission decisions.
///
/// `check_budget` always queries the daily window first, then the monthly
/// one. Providers may rely on that order to disambiguate windows that start
/// at the same instant (the 1st of a month at midnight).
#[async_trait]
pub trait UsageProvider: Send + Sync {
    async fn usage_since(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<UsageWindow>;
}

/// Resolve a local naive timestamp, falling back across DST gaps.
fn local_to_utc(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

/// `[local midnight today, local midnight tomorrow)`.
pub fn day_window(now: DateTime<Local>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let tomorrow = today + ChronoDuration::days(1);
    (local_to_utc(today), local_to_utc(tomorrow))
}

/// `[local month start, next local month start)`.
pub fn month_window(now: DateTime<Local>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
    let next = if today.month() == 12 {
        NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
    }
    .unwrap_or(start);
    (local_to_utc(start), local_to_utc(next))
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    ts: DateTime<Utc>,
    cost_usd: f64,
    tokens: u64,
}

/// In-memory usage ledger for a single-instance deployment. Workers record
/// an entry per completed task; sums are computed on demand.
#[derive(Default)]
pub struct UsageLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cost_usd: f64, tokens: u64) {
        self.record_at(Utc::now(), cost_usd, tokens);
    }

    pub fn record_at(&self, ts: DateTime<Utc>, cost_usd: f64, tokens: u64) {
        self.entries.lock().push(LedgerEntry {
            ts,
            cost_usd,
            tokens,
        });
    }

    /// Drop entries older than the given horizon. Called opportunistically
    /// by the daily roll so the ledger stays bounded.
    pub fn prune_before(&self, horizon: DateTime<Utc>) {
        self.entries.lock().retain(|e| e.ts >= horizon);
    }
}

#[async_trait]
impl UsageProvider for UsageLedger {
    async fn usage_since(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<UsageWindow> {
        let entries = self.entries.lock();
        let mut window = UsageWindow::default();
        for entry in entries.iter().filter(|e| e.ts >= start && e.ts < end) {
            window.cost_usd += entry.cost_usd;
            window.tokens += entry.tokens;
            window.calls += 1;
        }
        Ok(window)
    }
}
