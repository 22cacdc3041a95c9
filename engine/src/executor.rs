//! Subprocess executor client.
//!
//! The code-generating executor is opaque to the core: it is a shell command
//! that receives the task through `PILOT_TASK_*` environment variables and
//! emits one JSON event per stdout line. Every event is appended to the run
//! recording; token usage feeds the task limiter and, at the end, the usage
//! ledger.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pilot_budget::{TaskLimiter, UsageLedger};
use pilot_core::TaskHandler;
use pilot_observability::{ProcessKind, TaskEvent};
use pilot_recorder::Recorder;
use pilot_types::{Task, TaskResult};

pub struct ExecutorClient {
    command: String,
    recordings_dir: PathBuf,
    model: String,
    ledger: Arc<UsageLedger>,
}

impl ExecutorClient {
    pub fn new(
        command: impl Into<String>,
        recordings_dir: impl Into<PathBuf>,
        model: impl Into<String>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            command: command.into(),
            recordings_dir: recordings_dir.into(),
            model: model.into(),
            ledger,
        }
    }

}

#[async_trait]
impl TaskHandler for ExecutorClient {
    async fn handle(
        &self,
        task: &Task,
        limiter: Arc<TaskLimiter>,
        cancel: CancellationToken,
    ) -> anyhow::Result<TaskResult> {
        let task_id = task.id.to_string();
        let recorder = Recorder::create(&self.recordings_dir, &task_id, &self.model)
            .context("creating run recording")?;
        let run_id = recorder.id();
        TaskEvent::new(ProcessKind::Engine, "engine.executor", "executor.run", &task.id)
            .run_id(&run_id)
            .status("start")
            .emit();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("PILOT_TASK_ID", &task_id)
            .env("PILOT_TASK_TITLE", &task.title)
            .env("PILOT_TASK_DESCRIPTION", &task.description)
            .env("PILOT_TASK_URL", task.permalink.clone().unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .context("spawning executor")?;

        let stdout = child
            .stdout
            .take()
            .context("executor stdout unavailable")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut result = TaskResult::default();
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("executor for {task_id} cancelled; killing child");
                    let _ = child.kill().await;
                    cancelled = true;
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let Ok(event) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                            debug!("executor emitted non-JSON line: {trimmed}");
                            continue;
                        };
                        if let Err(e) = recorder.record(&event) {
                            warn!("recording event for {task_id} failed: {e}");
                        }

                        let tokens = event
                            .pointer("/usage/input_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0)
                            + event
                                .pointer("/usage/output_tokens")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(0);
                        if tokens > 0 && !limiter.add_tokens(tokens) {
                            warn!("token cap reached for {task_id}; killing executor");
                            let _ = child.kill().await;
                            break;
                        }
                        if !limiter.check_duration() {
                            warn!("duration cap reached for {task_id}; killing executor");
                            let _ = child.kill().await;
                            break;
                        }

                        if let Some(url) = event.get("pr_url").and_then(|v| v.as_str()) {
                            result.pr_url = Some(url.to_string());
                        }
                        if let Some(summary) = event.get("result").and_then(|v| v.as_str()) {
                            result.summary = Some(summary.to_string());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("executor stdout read error: {e}");
                        break;
                    }
                }
            }
        }

        let status = child.wait().await.context("waiting for executor")?;
        let exceeded = limiter.exceeded_reason();
        let run_status = if cancelled {
            "cancelled"
        } else if exceeded.is_some() {
            "limit_exceeded"
        } else if status.success() {
            "completed"
        } else {
            "failed"
        };

        let meta = recorder.finish(run_status).context("finishing recording")?;
        result.tokens_used = meta.token_usage.total();
        self.ledger
            .record(meta.estimated_cost_usd, result.tokens_used);
        let finish_event =
            TaskEvent::new(ProcessKind::Engine, "engine.executor", "executor.run", &task.id)
                .run_id(&run_id)
                .status(run_status);
        if run_status == "completed" {
            finish_event.emit();
        } else {
            finish_event.warn().emit();
        }

        if cancelled {
            bail!("task cancelled before the executor finished");
        }
        if let Some(reason) = exceeded {
            bail!("{reason}");
        }
        if !status.success() {
            bail!("executor exited with {status}");
        }
        Ok(result)
    }
}
