//! Streaming client for remote language runtimes.

mod client;
mod sse;

pub use client::{ExecuteOptions, RuntimeClient, RuntimeError};
pub use sse::{SseEvent, SseParser};

use serde_json::Value;

use crate::model::execution::{DisplayItem, ExecError};

/// A runtime prompt for interactive input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdinPrompt {
    pub prompt: String,
    pub password: bool,
}

/// Receiver for the typed events of one execution stream.
///
/// Callbacks fire in stream order on the task driving the request; default
/// implementations ignore the event.
pub trait ExecutionObserver: Send + Sync {
    fn on_start(&self) {}
    fn on_stdout(&self, _chunk: &str, _accumulated: &str) {}
    fn on_stderr(&self, _chunk: &str, _accumulated: &str) {}
    fn on_stdin_request(&self, _request: &StdinPrompt) {}
    fn on_display(&self, _display: &DisplayItem) {}
    fn on_result(&self, _result: &Value) {}
    fn on_error(&self, _error: &ExecError) {}
    fn on_done(&self) {}
}

/// Where an execution stream ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    /// Stream finished; carries the runtime's `result` payload if one was
    /// emitted.
    Completed(Option<Value>),
    /// The runtime reported an error event.
    Failed(ExecError),
    /// Cancelled locally before the stream finished. Not an error: the
    /// observer's `on_error` is never invoked for this case.
    Aborted,
}

impl ExecOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, ExecOutcome::Aborted)
    }

    pub fn error(&self) -> Option<ExecError> {
        match self {
            ExecOutcome::Failed(error) => Some(error.clone()),
            ExecOutcome::Aborted => Some(ExecError::aborted()),
            ExecOutcome::Completed(_) => None,
        }
    }
}
