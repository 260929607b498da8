//! Parsing of recorded session streams.
//!
//! A recording is a JSON document: a version string plus an event list,
//! each event an array of `[timestamp_ms, kind, args...]`. Only the major
//! version is gated; unknown event kinds are skipped so newer recorders
//! stay readable. Driving a [`crate::stepper::Stepper`] from the parsed
//! commands is left to the host, which owns pacing and scheduling.

use serde::Deserialize;
use thiserror::Error;

use crate::stepper::StepMode;

/// Major stream version this build understands.
pub const SUPPORTED_MAJOR: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct RawStream {
    pub version: String,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

/// One session command rebuilt from a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCommand {
    Step(StepMode),
    Interrupt,
    Restart,
    Undo,
    Redo,
}

/// A command with the recording-clock instant it was issued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayEvent {
    /// Milliseconds from the start of the recording.
    pub at: u64,
    pub command: ReplayCommand,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("unsupported stream version `{version}`")]
    UnsupportedVersion { version: String },
    #[error("malformed event at index {index}: {reason}")]
    Malformed { index: usize, reason: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Parses a recording into its command sequence. Parsing stops at the
/// first `end` event; anything after it is trailer data.
pub fn parse_stream(text: &str) -> Result<Vec<ReplayEvent>, ReplayError> {
    let raw: RawStream = serde_json::from_str(text)?;
    if major_version(&raw.version) != Some(SUPPORTED_MAJOR) {
        return Err(ReplayError::UnsupportedVersion {
            version: raw.version,
        });
    }

    let mut events = Vec::new();
    for (index, value) in raw.events.iter().enumerate() {
        let parts = value.as_array().ok_or_else(|| malformed(index, "event is not an array"))?;
        let at = parts
            .first()
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| malformed(index, "missing timestamp"))?;
        let kind = parts
            .get(1)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| malformed(index, "missing kind"))?;

        let command = match kind {
            "stepper.step" => {
                let name = parts
                    .get(2)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| malformed(index, "missing step mode"))?;
                let mode = StepMode::from_name(name).ok_or_else(|| {
                    malformed(index, &format!("unknown step mode `{name}`"))
                })?;
                ReplayCommand::Step(mode)
            }
            "stepper.interrupt" => ReplayCommand::Interrupt,
            "stepper.restart" => ReplayCommand::Restart,
            "stepper.undo" => ReplayCommand::Undo,
            "stepper.redo" => ReplayCommand::Redo,
            "end" => break,
            other => {
                tracing::debug!(kind = other, index, "skipping unknown event kind");
                continue;
            }
        };
        events.push(ReplayEvent { at, command });
    }
    Ok(events)
}

fn malformed(index: usize, reason: &str) -> ReplayError {
    ReplayError::Malformed {
        index,
        reason: reason.to_string(),
    }
}

fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_in_order() {
        let text = r#"{
            "version": "1.2",
            "events": [
                [0, "stepper.step", "into"],
                [150, "stepper.step", "over"],
                [900, "stepper.undo"],
                [1200, "stepper.restart"]
            ]
        }"#;
        let events = parse_stream(text).unwrap();
        assert_eq!(
            events,
            [
                ReplayEvent {
                    at: 0,
                    command: ReplayCommand::Step(StepMode::Into),
                },
                ReplayEvent {
                    at: 150,
                    command: ReplayCommand::Step(StepMode::Over),
                },
                ReplayEvent {
                    at: 900,
                    command: ReplayCommand::Undo,
                },
                ReplayEvent {
                    at: 1200,
                    command: ReplayCommand::Restart,
                },
            ]
        );
    }

    #[test]
    fn gates_on_the_major_version_only() {
        assert!(parse_stream(r#"{"version": "1.9", "events": []}"#).is_ok());
        let err = parse_stream(r#"{"version": "2.0", "events": []}"#).unwrap_err();
        assert!(matches!(err, ReplayError::UnsupportedVersion { .. }));
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let text = r#"{
            "version": "1.0",
            "events": [
                [0, "terminal.resize", 80, 24],
                [5, "stepper.step", "run"]
            ]
        }"#;
        let events = parse_stream(text).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, ReplayCommand::Step(StepMode::Run));
    }

    #[test]
    fn end_event_stops_parsing() {
        let text = r#"{
            "version": "1.0",
            "events": [
                [0, "stepper.step", "into"],
                [10, "end"],
                [20, "stepper.step", "into"]
            ]
        }"#;
        let events = parse_stream(text).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_events_are_rejected_with_their_index() {
        let text = r#"{"version": "1.0", "events": [[0, "stepper.step", "warp"]]}"#;
        let err = parse_stream(text).unwrap_err();
        assert!(
            matches!(err, ReplayError::Malformed { index: 0, ref reason } if reason.contains("warp"))
        );

        let text = r#"{"version": "1.0", "events": [{"kind": "stepper.undo"}]}"#;
        assert!(matches!(
            parse_stream(text).unwrap_err(),
            ReplayError::Malformed { index: 0, .. }
        ));
    }
}
