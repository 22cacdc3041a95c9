//! Execution recording for Pilot task runs.
//!
//! Every task run gets its own `TG-<ms-since-epoch>` directory holding an
//! append-only `stream.jsonl` of executor events, a terminal
//! `metadata.json`, a human-readable `summary.md`, and a `diffs/` directory
//! with per-file change captures. Recordings participate in restart-safety:
//! they are flushed line by line, so a crash mid-run still leaves a
//! replayable prefix.

pub mod cost;
pub mod events;
pub mod phase;
pub mod recorder;

pub use cost::{estimate_cost, TokenUsage};
pub use events::{parse_event, ParsedEvent, StreamEvent};
pub use phase::{phase_for_tool, phase_from_text, PhaseTiming, PhaseTracker};
pub use recorder::{Recorder, RecorderError, RecordingMeta};
