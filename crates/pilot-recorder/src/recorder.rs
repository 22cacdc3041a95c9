use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::cost::{estimate_cost, TokenUsage};
use crate::events::{parse_event, StreamEvent};
use crate::phase::{PhaseTiming, PhaseTracker};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recording already finished")]
    Finished,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Terminal metadata written next to the stream on `finish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub id: String,
    pub task: String,
    pub model: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub event_count: u64,
    pub token_usage: TokenUsage,
    pub estimated_cost_usd: f64,
    pub phases: Vec<PhaseTiming>,
    pub files_touched: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct FileCapture {
    before: Option<String>,
    after: Option<String>,
}

struct Inner {
    id: String,
    dir: PathBuf,
    stream: File,
    seq: u64,
    task: String,
    model: String,
    started_at: DateTime<Utc>,
    usage: TokenUsage,
    phases: PhaseTracker,
    /// path → before/after capture; BTreeMap keeps metadata output stable.
    files: BTreeMap<String, FileCapture>,
    finished: bool,
}

/// Append-only recorder for one task run. All mutation serializes under one
/// mutex; the expected caller is a single executor wrapper.
pub struct Recorder {
    inner: Mutex<Inner>,
}

impl Recorder {
    /// Create `TG-<ms-since-epoch>/` under `base_dir` with an empty
    /// `stream.jsonl`. A numeric suffix is appended when two recordings
    /// start within the same millisecond.
    pub fn create(
        base_dir: &Path,
        task: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, RecorderError> {
        let stamp = Utc::now().timestamp_millis();
        let mut id = format!("TG-{stamp}");
        let mut dir = base_dir.join(&id);
        let mut suffix = 0;
        while dir.exists() {
            suffix += 1;
            id = format!("TG-{stamp}-{suffix}");
            dir = base_dir.join(&id);
        }
        fs::create_dir_all(dir.join("diffs"))?;

        let stream = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join("stream.jsonl"))?;

        debug!("recorder: created {}", dir.display());
        Ok(Self {
            inner: Mutex::new(Inner {
                id,
                dir,
                stream,
                seq: 0,
                task: task.into(),
                model: model.into(),
                started_at: Utc::now(),
                usage: TokenUsage::default(),
                phases: PhaseTracker::new(),
                files: BTreeMap::new(),
                finished: false,
            }),
        })
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn dir(&self) -> PathBuf {
        self.inner.lock().dir.clone()
    }

    /// Append one event. Returns the assigned sequence number (from 1,
    /// strictly increasing). Each line is flushed so a crash keeps every
    /// event recorded so far.
    pub fn record(&self, raw: &Value) -> Result<u64, RecorderError> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(RecorderError::Finished);
        }

        let ts = Utc::now();
        let parsed = parse_event(raw);
        inner.usage.add(parsed.input_tokens, parsed.output_tokens);
        inner.phases.observe(&parsed, ts);
        if let Some(path) = parsed.touched_file() {
            inner.files.entry(path).or_default();
        }

        inner.seq += 1;
        let event = StreamEvent {
            seq: inner.seq,
            ts,
            raw: raw.clone(),
            parsed,
        };
        let line = serde_json::to_string(&event)?;
        inner.stream.write_all(line.as_bytes())?;
        inner.stream.write_all(b"\n")?;
        inner.stream.flush()?;
        Ok(inner.seq)
    }

    /// Capture a file's content before the executor touches it.
    pub fn record_file_before(&self, path: &str, content: &str) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(RecorderError::Finished);
        }
        let capture = inner.files.entry(path.to_string()).or_default();
        if capture.before.is_none() {
            capture.before = Some(content.to_string());
        }
        Ok(())
    }

    /// Capture a file's content after the run.
    pub fn record_file_after(&self, path: &str, content: &str) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(RecorderError::Finished);
        }
        inner.files.entry(path.to_string()).or_default().after = Some(content.to_string());
        Ok(())
    }

    /// Close the stream and write `metadata.json`, `summary.md`, and the
    /// diff set. Terminal: a second call returns
    /// [`RecorderError::Finished`] and leaves the first result untouched.
    pub fn finish(&self, status: &str) -> Result<RecordingMeta, RecorderError> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(RecorderError::Finished);
        }
        inner.finished = true;

        let finished_at = Utc::now();
        inner.phases.finish(finished_at);
        inner.stream.flush()?;
        inner.stream.sync_all()?;

        let meta = RecordingMeta {
            id: inner.id.clone(),
            task: inner.task.clone(),
            model: inner.model.clone(),
            status: status.to_string(),
            started_at: inner.started_at,
            finished_at,
            event_count: inner.seq,
            token_usage: inner.usage,
            estimated_cost_usd: estimate_cost(&inner.model, &inner.usage),
            phases: inner.phases.timings().to_vec(),
            files_touched: inner.files.keys().cloned().collect(),
        };

        fs::write(
            inner.dir.join("metadata.json"),
            serde_json::to_vec_pretty(&meta)?,
        )?;
        fs::write(inner.dir.join("summary.md"), render_summary(&meta))?;

        for (path, capture) in &inner.files {
            let (Some(before), Some(after)) = (&capture.before, &capture.after) else {
                continue;
            };
            if let Some(diff) = unified_diff(before, after) {
                let name = sanitize_file_name(path);
                fs::write(inner.dir.join("diffs").join(format!("{name}.diff")), diff)?;
            }
        }

        Ok(meta)
    }
}

fn render_summary(meta: &RecordingMeta) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run {} — {}\n\n", meta.id, meta.task));
    out.push_str(&format!("- Status: {}\n", meta.status));
    out.push_str(&format!("- Model: {}\n", meta.model));
    out.push_str(&format!(
        "- Duration: {}s\n",
        (meta.finished_at - meta.started_at).num_seconds()
    ));
    out.push_str(&format!("- Events: {}\n", meta.event_count));
    out.push_str(&format!(
        "- Tokens: {} in / {} out\n",
        meta.token_usage.input_tokens, meta.token_usage.output_tokens
    ));
    out.push_str(&format!("- Estimated cost: ${:.4}\n", meta.estimated_cost_usd));

    if !meta.phases.is_empty() {
        out.push_str("\n## Phases\n\n");
        for phase in &meta.phases {
            let duration = phase
                .ended_at
                .map(|end| (end - phase.started_at).num_seconds())
                .unwrap_or(0);
            out.push_str(&format!(
                "- {} — {} events, {}s\n",
                phase.name, phase.events, duration
            ));
        }
    }

    if !meta.files_touched.is_empty() {
        out.push_str("\n## Files\n\n");
        for file in &meta.files_touched {
            out.push_str(&format!("- `{file}`\n"));
        }
    }

    out
}

fn sanitize_file_name(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

/// Minimal line diff: trims the common prefix and suffix and emits one
/// `-`/`+` hunk for the middle. Returns `None` when the contents are equal.
pub fn unified_diff(before: &str, after: &str) -> Option<String> {
    if before == after {
        return None;
    }
    let before_lines: Vec<&str> = before.lines().collect();
    let after_lines: Vec<&str> = after.lines().collect();

    let mut prefix = 0;
    while prefix < before_lines.len()
        && prefix < after_lines.len()
        && before_lines[prefix] == after_lines[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < before_lines.len() - prefix
        && suffix < after_lines.len() - prefix
        && before_lines[before_lines.len() - 1 - suffix] == after_lines[after_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut out = format!(
        "@@ -{},{} +{},{} @@\n",
        prefix + 1,
        before_lines.len() - prefix - suffix,
        prefix + 1,
        after_lines.len() - prefix - suffix
    );
    for line in &before_lines[prefix..before_lines.len() - suffix] {
        out.push_str(&format!("-{line}\n"));
    }
    for line in &after_lines[prefix..after_lines.len() - suffix] {
        out.push_str(&format!("+{line}\n"));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn tool_event(tool: &str, path: &str) -> Value {
        json!({
            "type": "assistant",
            "tool_name": tool,
            "tool_input": { "file_path": path },
            "usage": { "input_tokens": 100, "output_tokens": 10 }
        })
    }

    #[test]
    fn stream_line_count_matches_metadata() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::create(tmp.path(), "ASANA-1", "claude-sonnet-4").unwrap();

        assert_eq!(recorder.record(&tool_event("Read", "a.rs")).unwrap(), 1);
        assert_eq!(recorder.record(&tool_event("Edit", "a.rs")).unwrap(), 2);
        assert_eq!(recorder.record(&json!({ "type": "result" })).unwrap(), 3);

        let dir = recorder.dir();
        let meta = recorder.finish("completed").unwrap();
        assert_eq!(meta.event_count, 3);

        let stream = std::fs::read_to_string(dir.join("stream.jsonl")).unwrap();
        let lines: Vec<_> = stream.lines().collect();
        assert_eq!(lines.len() as u64, meta.event_count);

        // seq strictly increasing from 1
        for (i, line) in lines.iter().enumerate() {
            let event: StreamEvent = serde_json::from_str(line).unwrap();
            assert_eq!(event.seq, i as u64 + 1);
        }
    }

    #[test]
    fn finish_is_terminal() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::create(tmp.path(), "t", "m").unwrap();
        recorder.record(&json!({ "type": "x" })).unwrap();
        recorder.finish("completed").unwrap();

        assert!(matches!(
            recorder.record(&json!({ "type": "y" })),
            Err(RecorderError::Finished)
        ));
        assert!(matches!(
            recorder.finish("completed"),
            Err(RecorderError::Finished)
        ));
    }

    #[test]
    fn metadata_accumulates_tokens_and_files() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::create(tmp.path(), "t", "claude-sonnet-4").unwrap();
        recorder.record(&tool_event("Read", "src/lib.rs")).unwrap();
        recorder.record(&tool_event("Write", "src/lib.rs")).unwrap();
        recorder.record(&tool_event("Edit", "src/main.rs")).unwrap();

        let meta = recorder.finish("completed").unwrap();
        assert_eq!(meta.token_usage.input_tokens, 300);
        assert_eq!(meta.token_usage.output_tokens, 30);
        assert!(meta.estimated_cost_usd > 0.0);
        assert_eq!(meta.files_touched, vec!["src/lib.rs", "src/main.rs"]);
        assert_eq!(meta.phases[0].name, "Exploring");
        assert_eq!(meta.phases[1].name, "Implementing");
    }

    #[test]
    fn diff_written_for_changed_files_only() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::create(tmp.path(), "t", "m").unwrap();
        recorder.record_file_before("src/a.rs", "fn a() {}\n").unwrap();
        recorder.record_file_after("src/a.rs", "fn a() { todo!() }\n").unwrap();
        recorder.record_file_before("src/b.rs", "same\n").unwrap();
        recorder.record_file_after("src/b.rs", "same\n").unwrap();

        let dir = recorder.dir();
        recorder.finish("completed").unwrap();

        assert!(dir.join("diffs/src_a.rs.diff").exists());
        assert!(!dir.join("diffs/src_b.rs.diff").exists());
    }

    #[test]
    fn unified_diff_trims_common_lines() {
        let before = "a\nb\nc\n";
        let after = "a\nB\nc\n";
        let diff = unified_diff(before, after).unwrap();
        assert!(diff.contains("-b\n"));
        assert!(diff.contains("+B\n"));
        assert!(!diff.contains("-a"));
        assert!(!diff.contains("-c"));
    }

    #[test]
    fn unified_diff_equal_is_none() {
        assert!(unified_diff("same", "same").is_none());
    }

    #[test]
    fn summary_mentions_status_and_phases() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::create(tmp.path(), "LINEAR-9", "m").unwrap();
        recorder.record(&tool_event("Read", "x.rs")).unwrap();
        let dir = recorder.dir();
        recorder.finish("failed").unwrap();

        let summary = std::fs::read_to_string(dir.join("summary.md")).unwrap();
        assert!(summary.contains("LINEAR-9"));
        assert!(summary.contains("Status: failed"));
        assert!(summary.contains("Exploring"));
    }

    #[test]
    fn concurrent_create_in_same_millisecond_gets_unique_dirs() {
        let tmp = TempDir::new().unwrap();
        let a = Recorder::create(tmp.path(), "t", "m").unwrap();
        let b = Recorder::create(tmp.path(), "t", "m").unwrap();
        assert_ne!(a.dir(), b.dir());
    }
}
