use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ParsedEvent;

/// Phase inference is heuristic: the tool→phase map is fixed, the
/// `Phase: X` text pattern is opportunistic. Timings derived from it are
/// advisory, not contractual.
pub fn phase_for_tool(tool: &str, input: Option<&serde_json::Value>) -> Option<&'static str> {
    match tool {
        "Read" | "Glob" | "Grep" => Some("Exploring"),
        "Write" | "Edit" => Some("Implementing"),
        "Bash" => {
            let command = input
                .and_then(|i| i.get("command"))
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            if command.contains("git commit") {
                Some("Committing")
            } else if command.contains("test") {
                Some("Testing")
            } else {
                None
            }
        }
        _ => None,
    }
}

/// `Phase: X` / `PHASE: X` at the start of a text line promotes `X` to the
/// current phase.
pub fn phase_from_text(text: &str) -> Option<String> {
    for line in text.lines() {
        let trimmed = line.trim();
        for prefix in ["Phase:", "PHASE:"] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                let name = rest.trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub events: u64,
}

/// Accumulates phase transitions as events stream through the recorder.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    timings: Vec<PhaseTiming>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &ParsedEvent, ts: DateTime<Utc>) {
        let inferred = event
            .text
            .as_deref()
            .and_then(phase_from_text)
            .or_else(|| {
                event
                    .tool_name
                    .as_deref()
                    .and_then(|t| phase_for_tool(t, event.tool_input.as_ref()))
                    .map(|p| p.to_string())
            });

        match inferred {
            Some(name) => {
                let changed = self
                    .timings
                    .last()
                    .map(|t| t.name != name)
                    .unwrap_or(true);
                if changed {
                    if let Some(last) = self.timings.last_mut() {
                        last.ended_at = Some(ts);
                    }
                    self.timings.push(PhaseTiming {
                        name,
                        started_at: ts,
                        ended_at: None,
                        events: 1,
                    });
                } else if let Some(last) = self.timings.last_mut() {
                    last.events += 1;
                }
            }
            None => {
                // Events with no phase signal accrue to the current phase.
                if let Some(last) = self.timings.last_mut() {
                    last.events += 1;
                }
            }
        }
    }

    pub fn finish(&mut self, ts: DateTime<Utc>) {
        if let Some(last) = self.timings.last_mut() {
            if last.ended_at.is_none() {
                last.ended_at = Some(ts);
            }
        }
    }

    pub fn timings(&self) -> &[PhaseTiming] {
        &self.timings
    }

    pub fn into_timings(self) -> Vec<PhaseTiming> {
        self.timings
    }
}
