//! Logging and structured events for Pilot processes.
//!
//! Each process writes two sinks: a compact console stream and a
//! daily-rotated JSONL file under `<state-dir>/logs/`, pruned on startup
//! after a retention window. Task lifecycle moments go through
//! [`TaskEvent`], which stamps every line with `tracker` and `task_id` so
//! one task can be followed across ticks and restarts with a single query.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pilot_types::TaskId;

pub use tracing_appender::non_blocking::WorkerGuard;

#[derive(Debug, Clone, Copy)]
pub enum ProcessKind {
    Engine,
    Executor,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Executor => "executor",
        }
    }

    fn file_prefix(self) -> String {
        format!("pilot.{}", self.as_str())
    }
}

/// Builder for one structured task-lifecycle log line.
///
/// ```ignore
/// TaskEvent::new(ProcessKind::Engine, "engine.executor", "executor.run", &task.id)
///     .run_id(&run_id)
///     .status("start")
///     .emit();
/// ```
pub struct TaskEvent<'a> {
    process: ProcessKind,
    component: &'a str,
    event: &'a str,
    tracker: &'static str,
    task_id: String,
    run_id: &'a str,
    status: &'a str,
    detail: &'a str,
    level: Level,
}

impl<'a> TaskEvent<'a> {
    pub fn new(
        process: ProcessKind,
        component: &'a str,
        event: &'a str,
        task: &TaskId,
    ) -> Self {
        Self {
            process,
            component,
            event,
            tracker: task.tracker.as_str(),
            task_id: task.to_string(),
            run_id: "",
            status: "",
            detail: "",
            level: Level::INFO,
        }
    }

    pub fn run_id(mut self, run_id: &'a str) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = status;
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = detail;
        self
    }

    pub fn warn(mut self) -> Self {
        self.level = Level::WARN;
        self
    }

    pub fn error(mut self) -> Self {
        self.level = Level::ERROR;
        self
    }

    pub fn emit(self) {
        // The level must be literal inside the tracing macros, so each one
        // gets its own arm.
        match self.level {
            Level::ERROR => tracing::error!(
                target: "pilot.obs",
                process = self.process.as_str(),
                component = self.component,
                event = self.event,
                tracker = self.tracker,
                task_id = %self.task_id,
                run_id = self.run_id,
                status = self.status,
                detail = self.detail,
                "task_event"
            ),
            Level::WARN => tracing::warn!(
                target: "pilot.obs",
                process = self.process.as_str(),
                component = self.component,
                event = self.event,
                tracker = self.tracker,
                task_id = %self.task_id,
                run_id = self.run_id,
                status = self.status,
                detail = self.detail,
                "task_event"
            ),
            _ => tracing::info!(
                target: "pilot.obs",
                process = self.process.as_str(),
                component = self.component,
                event = self.event,
                tracker = self.tracker,
                task_id = %self.task_id,
                run_id = self.run_id,
                status = self.status,
                detail = self.detail,
                "task_event"
            ),
        }
    }
}

/// Mask a tracker credential for logs. Known key shapes keep their scheme
/// prefix so an operator can tell which kind of credential is configured;
/// the secret part is replaced by its length and a short fingerprint.
pub fn redact_credential(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let prefix = credential_prefix(trimmed);
    let secret = &trimmed[prefix.len()..];
    format!(
        "{prefix}…[{} chars, {}]",
        secret.chars().count(),
        fingerprint(secret)
    )
}

/// Linear keys lead with `lin_api_` / `lin_oauth_`; Asana PATs lead with a
/// numeric version and a slash (`2/…`). Azure DevOps PATs are opaque and
/// get no prefix.
fn credential_prefix(raw: &str) -> &str {
    for known in ["lin_api_", "lin_oauth_"] {
        if raw.starts_with(known) {
            return &raw[..known.len()];
        }
    }
    if let Some(slash) = raw.find('/') {
        if slash > 0 && slash <= 2 && raw[..slash].chars().all(|c| c.is_ascii_digit()) {
            return &raw[..slash + 1];
        }
    }
    ""
}

fn fingerprint(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// Install the console + JSONL subscriber for this process.
///
/// JSONL files are named `pilot.<process>.YYYY-MM-DD.jsonl` under
/// `<state_dir>/logs/`; files older than `retention_days` are removed
/// before the appender opens. Returns the appender guard (keep it alive
/// for the process lifetime) and the logs directory.
pub fn init_logging(
    process: ProcessKind,
    state_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, PathBuf)> {
    let logs_dir = state_dir.join("logs");
    fs::create_dir_all(&logs_dir)?;
    prune_rotated_logs(&logs_dir, process, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(process.file_prefix())
        .filename_suffix("jsonl")
        .build(&logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .ok();

    Ok((guard, logs_dir))
}

fn prune_rotated_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
) -> anyhow::Result<()> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", process.file_prefix());

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(date_part) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff {
            let _ = fs::remove_file(entry.path());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_types::TrackerKind;

    #[test]
    fn linear_keys_keep_their_scheme_prefix() {
        let masked = redact_credential("lin_api_0123456789abcdef0123456789abcdef");
        assert!(masked.starts_with("lin_api_…["), "{masked}");
        assert!(!masked.contains("0123456789abcdef"));
        assert!(masked.contains("32 chars"));
    }

    #[test]
    fn asana_pats_keep_their_version_prefix() {
        let masked = redact_credential("2/1207531234567890/secretsecretsecret");
        assert!(masked.starts_with("2/…["), "{masked}");
        assert!(!masked.contains("secret"));
    }

    #[test]
    fn opaque_pats_are_fully_masked() {
        let masked = redact_credential("x7gqtrwqlkjh4nmzv2p8");
        assert!(masked.starts_with("…["), "{masked}");
        assert!(!masked.contains("x7gq"));
    }

    #[test]
    fn same_secret_yields_same_fingerprint() {
        assert_eq!(redact_credential("abc123"), redact_credential("abc123"));
        assert_ne!(redact_credential("abc123"), redact_credential("abc124"));
    }

    #[test]
    fn empty_credential_is_empty() {
        assert_eq!(redact_credential("   "), "");
    }

    #[test]
    fn prune_removes_only_expired_files_for_this_process() {
        let tmp = tempfile::TempDir::new().unwrap();
        let today = Utc::now().format("%Y-%m-%d");
        let old = tmp.path().join("pilot.engine.2020-01-01.jsonl");
        let recent = tmp.path().join(format!("pilot.engine.{today}.jsonl"));
        let other_process = tmp.path().join("pilot.executor.2020-01-01.jsonl");
        let unrelated = tmp.path().join("notes.txt");
        for path in [&old, &recent, &other_process, &unrelated] {
            fs::write(path, "{}").unwrap();
        }

        prune_rotated_logs(tmp.path(), ProcessKind::Engine, 7).unwrap();

        assert!(!old.exists());
        assert!(recent.exists());
        assert!(other_process.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn task_event_emits_without_a_subscriber() {
        let id = TaskId::new(TrackerKind::Asana, "42");
        TaskEvent::new(ProcessKind::Engine, "engine.poller", "task.dispatch", &id)
            .run_id("TG-1")
            .status("start")
            .detail("smoke")
            .warn()
            .emit();
    }
}
