//! Wire types exchanged between `nettraced` and `nettrace`.
//!
//! These mirror the JSON envelopes in the HTTP API: plain serde structs, no
//! I/O, no daemon-side behavior. Keeping them in their own crate lets the
//! CLI depend on the wire format without depending on the daemon's probe
//! and bus machinery.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One event emitted onto a tracing task's bus, tagged with the probe that
/// produced it and the wall-clock time it was received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingEvent {
    /// Nanoseconds since the UNIX epoch.
    pub timestamp: u64,
    pub probe: String,
    pub event: Value,
}

/// Ring/subscriber sizing for a tracing task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TracingTaskEventOptions {
    #[serde(default = "default_buffer_length")]
    pub buffer_length: usize,
}

fn default_buffer_length() -> usize {
    100
}

impl Default for TracingTaskEventOptions {
    fn default() -> Self {
        Self {
            buffer_length: default_buffer_length(),
        }
    }
}

/// Request body for `POST /tracing_tasks`, and the `options` field returned
/// by every other tracing-task endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingTaskOptions {
    /// Probe-type name to per-probe options, e.g. `{"demo": {"interval": 0.1}}`.
    pub probes: HashMap<String, Value>,
    #[serde(default)]
    pub events: TracingTaskEventOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingTaskResponse {
    pub id: String,
    pub options: TracingTaskOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfoResponse {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

pub type ListTracingTasksResponse = Vec<TracingTaskResponse>;
pub type GetTracingTaskResponse = TracingTaskResponse;
pub type CreateTracingTaskRequest = TracingTaskOptions;
pub type CreateTracingTaskResponse = IdResponse;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_event_round_trips() {
        let event = TracingEvent {
            timestamp: 1_700_000_000_000_000_000,
            probe: "demo".into(),
            event: serde_json::json!({"current_time": "2026-08-01T00:00:00"}),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: TracingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.timestamp, back.timestamp);
        assert_eq!(event.probe, back.probe);
        assert_eq!(event.event, back.event);
    }

    #[test]
    fn task_options_default_buffer_length() {
        let opts: TracingTaskOptions =
            serde_json::from_str(r#"{"probes":{"demo":{}}}"#).unwrap();
        assert_eq!(opts.events.buffer_length, 100);
    }
}
