use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::sse::{SseEvent, SseParser};
use super::{ExecOutcome, ExecutionObserver, StdinPrompt};
use crate::model::execution::{DisplayItem, ExecError};

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub session: String,
    pub exec_id: String,
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime connection failed: {0}")]
    Connection(String),
    #[error("runtime returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("execution {0} already has an active stream")]
    AlreadyActive(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RuntimeError {
    /// The error payload this failure should leave on the coordination
    /// record.
    pub fn to_exec_error(&self) -> ExecError {
        match self {
            RuntimeError::Connection(_) | RuntimeError::Status { .. } | RuntimeError::Http(_) => {
                ExecError::connection(self.to_string())
            }
            RuntimeError::AlreadyActive(_) => ExecError::monitor(self.to_string()),
        }
    }
}

#[derive(Default)]
struct CancelHandle {
    notify: Notify,
    cancelled: AtomicBool,
}

impl CancelHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// HTTP/SSE client for runtime execution streams.
///
/// Each in-flight `execute` registers a cancellation handle under its
/// execution id; cancelling drops the request mid-stream and resolves the
/// call with [`ExecOutcome::Aborted`].
pub struct RuntimeClient {
    http: reqwest::Client,
    active: Mutex<HashMap<String, Arc<CancelHandle>>>,
}

impl RuntimeClient {
    pub fn new() -> Result<Self, RuntimeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Open the execution stream and dispatch its events until it closes,
    /// errors, or is cancelled. Executions of arbitrary duration are
    /// expected; there is no read timeout.
    pub async fn execute(
        &self,
        runtime_url: &str,
        code: &str,
        options: ExecuteOptions,
        observer: &dyn ExecutionObserver,
    ) -> Result<ExecOutcome, RuntimeError> {
        let handle = self.register(&options.exec_id)?;
        let _guard = ActiveGuard {
            client: self,
            exec_id: options.exec_id.clone(),
        };

        let url = endpoint(runtime_url, "execute/stream");
        let body = json!({
            "code": code,
            "session": options.session,
            "storeHistory": true,
        });

        let response = tokio::select! {
            _ = handle.notify.notified() => return Ok(ExecOutcome::Aborted),
            sent = self.http.post(&url).json(&body).send() => match sent {
                Ok(response) => response,
                Err(err) => {
                    let error = ExecError::connection(err.to_string());
                    observer.on_error(&error);
                    return Err(RuntimeError::Connection(err.to_string()));
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Status { status, body });
        }

        observer.on_start();

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut state = StreamState::default();

        loop {
            if handle.is_cancelled() {
                return Ok(ExecOutcome::Aborted);
            }
            let chunk = tokio::select! {
                _ = handle.notify.notified() => return Ok(ExecOutcome::Aborted),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let mut finished = false;
                    for event in parser.feed(&text) {
                        if dispatch_event(&event, observer, &mut state) {
                            finished = true;
                        }
                    }
                    if finished {
                        break;
                    }
                }
                Some(Err(err)) => {
                    let error = ExecError::connection(err.to_string());
                    observer.on_error(&error);
                    return Err(RuntimeError::Connection(err.to_string()));
                }
                None => break,
            }
        }

        observer.on_done();
        Ok(state.into_outcome())
    }

    /// Abort the in-flight stream for `exec_id`. Advisory towards the
    /// runtime itself; pair with [`RuntimeClient::interrupt`] to actually
    /// stop remote work.
    pub fn cancel(&self, exec_id: &str) -> bool {
        let handle = self.active.lock().unwrap().get(exec_id).cloned();
        match handle {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let handles: Vec<Arc<CancelHandle>> =
            self.active.lock().unwrap().values().cloned().collect();
        for handle in handles {
            handle.cancel();
        }
    }

    pub fn is_active(&self, exec_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(exec_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Forward one line of interactive input to the runtime.
    pub async fn send_input(
        &self,
        runtime_url: &str,
        session: &str,
        exec_id: &str,
        text: &str,
    ) -> Result<Value, RuntimeError> {
        let body = json!({ "session": session, "exec_id": exec_id, "text": text });
        self.post_json(&endpoint(runtime_url, "input"), &body).await
    }

    /// Interrupt whatever the session is currently executing.
    pub async fn interrupt(&self, runtime_url: &str, session: &str) -> Result<Value, RuntimeError> {
        let body = json!({ "session": session });
        self.post_json(&endpoint(runtime_url, "interrupt"), &body)
            .await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, RuntimeError> {
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Status { status, body });
        }
        Ok(response.json::<Value>().await?)
    }

    fn register(&self, exec_id: &str) -> Result<Arc<CancelHandle>, RuntimeError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(exec_id) {
            return Err(RuntimeError::AlreadyActive(exec_id.to_string()));
        }
        let handle = Arc::new(CancelHandle::default());
        active.insert(exec_id.to_string(), handle.clone());
        Ok(handle)
    }
}

struct ActiveGuard<'a> {
    client: &'a RuntimeClient,
    exec_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.client.active.lock().unwrap().remove(&self.exec_id);
    }
}

#[derive(Default)]
struct StreamState {
    stdout: String,
    stderr: String,
    result: Option<Value>,
    error: Option<ExecError>,
}

impl StreamState {
    fn into_outcome(self) -> ExecOutcome {
        match self.error {
            Some(error) => ExecOutcome::Failed(error),
            None => ExecOutcome::Completed(self.result),
        }
    }
}

fn endpoint(runtime_url: &str, path: &str) -> String {
    format!("{}/{}", runtime_url.trim_end_matches('/'), path)
}

/// Returns true when the stream signalled completion.
fn dispatch_event(
    event: &SseEvent,
    observer: &dyn ExecutionObserver,
    state: &mut StreamState,
) -> bool {
    let payload: Value = match serde_json::from_str(&event.data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(event = %event.name, %err, "skipping unparseable event payload");
            return false;
        }
    };

    match event.name.as_str() {
        "start" => {
            debug!("runtime acknowledged execution");
        }
        "stdout" => {
            let chunk = payload["content"].as_str().unwrap_or_default();
            state.stdout.push_str(chunk);
            observer.on_stdout(chunk, &state.stdout);
        }
        "stderr" => {
            let chunk = payload["content"].as_str().unwrap_or_default();
            state.stderr.push_str(chunk);
            observer.on_stderr(chunk, &state.stderr);
        }
        "stdin_request" => {
            let request = StdinPrompt {
                prompt: payload["prompt"].as_str().unwrap_or_default().to_string(),
                password: payload["password"].as_bool().unwrap_or(false),
            };
            observer.on_stdin_request(&request);
        }
        "display" => match serde_json::from_value::<DisplayItem>(payload) {
            Ok(display) => observer.on_display(&display),
            Err(err) => warn!(%err, "skipping malformed display event"),
        },
        "asset" => {
            let display = DisplayItem {
                mime_type: payload["mimeType"]
                    .as_str()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                data: None,
                asset_id: payload["path"].as_str().map(str::to_string),
                url: payload["url"].as_str().map(str::to_string),
            };
            observer.on_display(&display);
        }
        "result" => {
            state.result = Some(payload.clone());
            observer.on_result(&payload);
        }
        "error" => {
            let error = serde_json::from_value::<ExecError>(payload.clone()).unwrap_or_else(|_| {
                ExecError::new("RuntimeError", payload.to_string())
            });
            state.error = Some(error.clone());
            observer.on_error(&error);
        }
        "done" => return true,
        other => {
            debug!(event = other, "ignoring unrecognized stream event");
        }
    }
    false
}
