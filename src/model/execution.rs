use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Numeric peer identity assigned by the CRDT layer, unique per connected
/// participant (browser or monitor).
pub type PeerId = u64;

/// Lifecycle of an execution record.
///
/// `Requested → Claimed → Ready → Running → {Completed, Error, Cancelled}`,
/// with `Cancelled` also reachable from `Claimed`, `Ready` and `Running`.
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Requested,
    Claimed,
    Ready,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ExecStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecStatus::Completed | ExecStatus::Error | ExecStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Requested => "requested",
            ExecStatus::Claimed => "claimed",
            ExecStatus::Ready => "ready",
            ExecStatus::Running => "running",
            ExecStatus::Completed => "completed",
            ExecStatus::Error => "error",
            ExecStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending request for interactive input, published by the monitor and
/// answered by a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdinRequest {
    pub prompt: String,
    pub password: bool,
    pub requested_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdinResponse {
    pub text: String,
    pub responded_at: i64,
}

/// One rich output item. Inline payloads carry `data`; runtime-side assets
/// carry `asset_id`/`url` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayItem {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Error payload stored on a record or delivered through a callback.
/// Runtime-reported errors pass through verbatim; extra fields survive in
/// `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ExecError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new("ConnectionError", message)
    }

    pub fn sync(message: impl Into<String>) -> Self {
        Self::new("SyncError", message)
    }

    pub fn monitor(message: impl Into<String>) -> Self {
        Self::new("MonitorError", message)
    }

    pub fn aborted() -> Self {
        Self::new("Aborted", "Execution cancelled")
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The shared-map value keyed by execution id: the sole rendezvous point
/// between a browser requesting work and a monitor performing it.
///
/// Browsers create records and own the stdin responses and output-region
/// bookkeeping; the claiming monitor owns coordination status, output and
/// results. Every nullable field is encoded as an explicit null so peers on
/// either side see the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    #[serde(default)]
    pub cell_id: Option<String>,
    pub code: String,
    pub language: String,
    pub runtime_url: String,
    pub session: String,
    pub status: ExecStatus,
    #[serde(default)]
    pub requested_by: Option<PeerId>,
    #[serde(default)]
    pub claimed_by: Option<PeerId>,
    #[serde(default)]
    pub requested_at: Option<i64>,
    #[serde(default)]
    pub claimed_at: Option<i64>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub output_block_ready: bool,
    #[serde(default)]
    pub output_position: Option<String>,
    #[serde(default)]
    pub stdin_request: Option<StdinRequest>,
    #[serde(default)]
    pub stdin_response: Option<StdinResponse>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ExecError>,
    #[serde(default)]
    pub display_data: Vec<DisplayItem>,
}

/// Immutable request half of a record, supplied by the peer creating it.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    pub runtime_url: String,
    pub session: String,
    pub cell_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        runtime_url: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            runtime_url: runtime_url.into(),
            session: "default".to_string(),
            cell_id: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn with_cell_id(mut self, cell_id: impl Into<String>) -> Self {
        self.cell_id = Some(cell_id.into());
        self
    }
}

impl ExecutionRecord {
    pub fn requested(id: String, request: ExecutionRequest, requested_by: PeerId) -> Self {
        Self {
            id,
            cell_id: request.cell_id,
            code: request.code,
            language: request.language,
            runtime_url: request.runtime_url,
            session: request.session,
            status: ExecStatus::Requested,
            requested_by: Some(requested_by),
            claimed_by: None,
            requested_at: Some(now_millis()),
            claimed_at: None,
            started_at: None,
            completed_at: None,
            output_block_ready: false,
            output_position: None,
            stdin_request: None,
            stdin_response: None,
            result: None,
            error: None,
            display_data: Vec::new(),
        }
    }

    pub fn is_claimed_by(&self, peer: PeerId) -> bool {
        self.claimed_by == Some(peer)
    }
}

/// Epoch milliseconds, the timestamp unit shared with browser peers.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

const EXEC_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A fresh execution id: `exec-<epoch millis>-<6 base36 chars>`.
pub fn generate_exec_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| EXEC_ID_ALPHABET[rng.gen_range(0..EXEC_ID_ALPHABET.len())] as char)
        .collect();
    format!("exec-{}-{}", now_millis(), suffix)
}
