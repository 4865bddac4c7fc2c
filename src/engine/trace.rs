//! Per-request event tracing in Chrome trace format.
//!
//! Events named `"start <span>"` and `"finish <span>"` open and close a
//! duration slice, everything else becomes an instant marker. The dump loads
//! directly in `chrome://tracing` or Perfetto, one track per request.

use std::cell::RefCell;
use std::time::Instant;

use serde::Serialize;

use crate::error::ServeError;

#[derive(Debug, Clone, Serialize)]
struct TraceEvent {
    name: String,
    cat: &'static str,
    ph: &'static str,
    ts: u64,
    pid: u32,
    tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    s: Option<&'static str>,
    args: TraceArgs,
}

#[derive(Debug, Clone, Serialize)]
struct TraceArgs {
    request_id: String,
}

#[derive(Serialize)]
struct TraceDocument<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: &'a [TraceEvent],
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: &'static str,
}

/// Collects timestamped request events.
///
/// Recording takes `&self` so the recorder can be shared with a stream
/// callback. Timestamps are microseconds since the recorder was created.
pub struct EventTraceRecorder {
    origin: Instant,
    events: RefCell<Vec<TraceEvent>>,
}

impl Default for EventTraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTraceRecorder {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            events: RefCell::new(Vec::new()),
        }
    }

    pub fn add_event(&self, request_id: &str, event: &str) {
        let (name, ph, s) = if let Some(span) = event.strip_prefix("start ") {
            (span, "B", None)
        } else if let Some(span) = event.strip_prefix("finish ") {
            (span, "E", None)
        } else {
            (event, "i", Some("t"))
        };
        let ts = self.origin.elapsed().as_micros() as u64;
        self.events.borrow_mut().push(TraceEvent {
            name: name.to_string(),
            cat: "request",
            ph,
            ts,
            pid: 0,
            tid: request_id.parse().unwrap_or(0),
            s,
            args: TraceArgs {
                request_id: request_id.to_string(),
            },
        });
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn dump_json(&self) -> Result<String, ServeError> {
        let events = self.events.borrow();
        Ok(serde_json::to_string(&TraceDocument {
            trace_events: &events,
            display_time_unit: "ms",
        })?)
    }
}
