//! Call traces and the per-session call log.
//!
//! A `CallTrace` records one intercepted operation: method name, argument
//! summary, entry/exit timestamps, outcome and nested child traces. Each
//! session keeps its completed traces in a bounded `CallLog`.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::epoch_millis;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("call trace for '{0}' is already complete")]
    AlreadyComplete(String),
}

/// Nestable record of one intercepted call.
#[derive(Debug, Clone, Serialize)]
pub struct CallTrace {
    method: String,
    arguments: String,
    /// Epoch milliseconds.
    entered_at: u64,
    exited_at: Option<u64>,
    #[serde(skip)]
    started: Instant,
    duration: Duration,
    error: Option<String>,
    message: Option<String>,
    children: Vec<CallTrace>,
}

impl CallTrace {
    /// Open a trace; the entry timestamp is taken now.
    pub fn begin(method: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            arguments: arguments.into(),
            entered_at: epoch_millis(),
            exited_at: None,
            started: Instant::now(),
            duration: Duration::ZERO,
            error: None,
            message: None,
            children: Vec::new(),
        }
    }

    pub fn add_child(&mut self, child: CallTrace) -> Result<(), TraceError> {
        if self.is_complete() {
            return Err(TraceError::AlreadyComplete(self.method.clone()));
        }
        self.children.push(child);
        Ok(())
    }

    /// Close the trace, recording duration, error and an exit message.
    pub fn complete(
        &mut self,
        error: Option<String>,
        message: Option<String>,
    ) -> Result<(), TraceError> {
        if self.is_complete() {
            return Err(TraceError::AlreadyComplete(self.method.clone()));
        }
        self.duration = self.started.elapsed();
        self.exited_at = Some(epoch_millis());
        self.error = error;
        self.message = message;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.exited_at.is_some()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    pub fn entered_at(&self) -> u64 {
        self.entered_at
    }

    pub fn exited_at(&self) -> Option<u64> {
        self.exited_at
    }

    /// Zero until completed.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn children(&self) -> &[CallTrace] {
        &self.children
    }

    /// Multi-line rendering, children indented one level deeper.
    ///
    /// ```text
    /// 10:15:02.120 @ update: [emp {id: 7, sal: 800->900}]
    ///   10:15:02.120 @ getConnection
    ///   10:15:02.121 > 1 ms
    /// 10:15:02.134 > 14 ms
    /// ```
    pub fn render(&self, indent: usize) -> String {
        let pad = "  ".repeat(indent);
        let mut out = String::new();
        if self.arguments.is_empty() {
            out.push_str(&format!("{pad}{} @ {}\n", clock(self.entered_at), self.method));
        } else {
            out.push_str(&format!(
                "{pad}{} @ {}: {}\n",
                clock(self.entered_at),
                self.method,
                self.arguments
            ));
        }
        for child in &self.children {
            out.push_str(&child.render(indent + 1));
        }
        if let Some(exited_at) = self.exited_at {
            out.push_str(&format!(
                "{pad}{} > {} ms",
                clock(exited_at),
                self.duration.as_millis()
            ));
            if let Some(message) = &self.message {
                out.push_str(&format!(" ({message})"));
            }
            out.push('\n');
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("{pad}! {error}\n"));
        }
        out
    }
}

/// `HH:MM:SS.mmm` (UTC) of an epoch-millisecond timestamp.
fn clock(epoch_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|dt| dt.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "--:--:--.---".to_string())
}

// ── Call log ────────────────────────────────────────────────────────

/// Bounded ring buffer of completed traces plus last access/exit info.
#[derive(Debug)]
pub struct CallLog {
    capacity: usize,
    enabled: bool,
    entries: VecDeque<CallTrace>,
    last_access_time: u64,
    last_accessed_method: Option<String>,
    last_access_arguments: Option<String>,
    last_exit_time: u64,
    last_exited_method: Option<String>,
}

impl CallLog {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let now = epoch_millis();
        Self {
            capacity,
            enabled,
            entries: VecDeque::with_capacity(capacity.min(1024)),
            last_access_time: now,
            last_accessed_method: None,
            last_access_arguments: None,
            last_exit_time: now,
            last_exited_method: None,
        }
    }

    pub fn record_access(&mut self, method: &str, arguments: &str) {
        self.last_access_time = epoch_millis();
        self.last_accessed_method = Some(method.to_string());
        self.last_access_arguments = Some(arguments.to_string());
    }

    pub fn record_exit(&mut self, method: &str) {
        self.last_exit_time = epoch_millis();
        self.last_exited_method = Some(method.to_string());
    }

    /// Append a completed trace, evicting the oldest when full.
    /// Ignored while logging is disabled.
    pub fn append(&mut self, trace: CallTrace) {
        if !self.enabled || self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(trace);
    }

    /// Disabling logging discards the buffered entries.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.entries.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CallTrace> {
        self.entries.iter()
    }

    pub fn last_access_time(&self) -> u64 {
        self.last_access_time
    }

    pub fn last_exit_time(&self) -> u64 {
        self.last_exit_time
    }

    pub fn last_accessed_method(&self) -> Option<&str> {
        self.last_accessed_method.as_deref()
    }

    pub fn snapshot(&self, client_id: Uuid, connected_at: u64) -> ClientLog {
        ClientLog {
            client_id,
            connected_at,
            logging_enabled: self.enabled,
            last_access_time: self.last_access_time,
            last_accessed_method: self.last_accessed_method.clone(),
            last_access_arguments: self.last_access_arguments.clone(),
            last_exit_time: self.last_exit_time,
            last_exited_method: self.last_exited_method.clone(),
            entries: self.entries.iter().cloned().collect(),
        }
    }
}

/// Point-in-time copy of a session's call log, as served to admins.
#[derive(Debug, Clone, Serialize)]
pub struct ClientLog {
    pub client_id: Uuid,
    pub connected_at: u64,
    pub logging_enabled: bool,
    pub last_access_time: u64,
    pub last_accessed_method: Option<String>,
    pub last_access_arguments: Option<String>,
    pub last_exit_time: u64,
    pub last_exited_method: Option<String>,
    pub entries: Vec<CallTrace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_kept_in_insertion_order() {
        let mut trace = CallTrace::begin("update", "emp {id: 7}");
        let mut first = CallTrace::begin("getConnection", "");
        first.complete(None, Some("retries: 2".into())).unwrap();
        let mut second = CallTrace::begin("validate", "");
        second.complete(None, None).unwrap();

        trace.add_child(first).unwrap();
        trace.add_child(second).unwrap();
        trace.complete(None, None).unwrap();

        let names: Vec<&str> = trace.children().iter().map(|c| c.method()).collect();
        assert_eq!(names, ["getConnection", "validate"]);
        assert!(trace.exited_at().unwrap() >= trace.entered_at());
    }

    #[test]
    fn duration_zero_until_complete() {
        let trace = CallTrace::begin("selectAll", "emp");
        assert_eq!(trace.duration(), Duration::ZERO);
        assert!(!trace.is_complete());
    }

    #[test]
    fn second_complete_fails() {
        let mut trace = CallTrace::begin("insert", "");
        trace.complete(None, None).unwrap();
        assert_eq!(
            trace.complete(Some("late".into()), None),
            Err(TraceError::AlreadyComplete("insert".into()))
        );
        assert_eq!(trace.error(), None);
    }

    #[test]
    fn add_child_after_complete_fails() {
        let mut trace = CallTrace::begin("insert", "");
        trace.complete(None, None).unwrap();
        assert!(trace.add_child(CallTrace::begin("getConnection", "")).is_err());
        assert!(trace.children().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_measures_elapsed_time() {
        let mut trace = CallTrace::begin("selectMany", "emp");
        tokio::time::advance(Duration::from_millis(120)).await;
        trace.complete(None, None).unwrap();
        assert_eq!(trace.duration(), Duration::from_millis(120));
    }

    #[test]
    fn render_indents_children_and_shows_message_and_error() {
        let mut trace = CallTrace::begin("update", "emp {id: 7}");
        let mut child = CallTrace::begin("getConnection", "");
        child.complete(None, Some("retries: 1".into())).unwrap();
        trace.add_child(child).unwrap();
        trace
            .complete(Some("record modified by another user: emp".into()), None)
            .unwrap();

        let rendered = trace.render(0);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("@ update: emp {id: 7}"));
        assert!(lines[1].starts_with("  ") && lines[1].ends_with("@ getConnection"));
        assert!(lines[2].ends_with("(retries: 1)"));
        assert!(lines[3].contains(" > "));
        assert_eq!(lines[4], "! record modified by another user: emp");
    }

    #[test]
    fn clock_formats_time_of_day() {
        assert_eq!(clock(0), "00:00:00.000");
        assert_eq!(clock(3_723_045), "01:02:03.045");
        assert_eq!(clock(86_400_001), "00:00:00.001");
    }

    fn completed(method: &str) -> CallTrace {
        let mut trace = CallTrace::begin(method, "");
        trace.complete(None, None).unwrap();
        trace
    }

    #[test]
    fn log_evicts_oldest_first() {
        let mut log = CallLog::new(2, true);
        log.append(completed("a"));
        log.append(completed("b"));
        log.append(completed("c"));
        let names: Vec<&str> = log.entries().map(|t| t.method()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn disabled_log_ignores_appends_and_clears() {
        let mut log = CallLog::new(4, true);
        log.append(completed("a"));
        log.set_enabled(false);
        assert!(log.is_empty());
        log.append(completed("b"));
        assert!(log.is_empty());
    }

    #[test]
    fn access_and_exit_recorded_in_snapshot() {
        let mut log = CallLog::new(4, true);
        log.record_access("selectAll", "emp");
        log.record_exit("selectAll");
        let snapshot = log.snapshot(Uuid::nil(), 1);
        assert_eq!(snapshot.last_accessed_method.as_deref(), Some("selectAll"));
        assert_eq!(snapshot.last_access_arguments.as_deref(), Some("emp"));
        assert_eq!(snapshot.last_exited_method.as_deref(), Some("selectAll"));
        assert!(snapshot.last_exit_time >= snapshot.last_access_time);
    }
}
