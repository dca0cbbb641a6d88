//! Typed view over the shared `executions` map.
//!
//! Every non-creating write is a read-modify-write that replaces the whole
//! record value, so last-writer-wins resolution operates on consistent
//! records rather than field mixtures. Competing claims are settled by the
//! CRDT: a peer only trusts its claim after a converged read still shows
//! `claimed_by == self`.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use yrs::types::{EntryChange, Value};
use yrs::{Any, Map, Observable, Transact};

use crate::model::execution::{
    generate_exec_id, now_millis, DisplayItem, ExecError, ExecStatus, ExecutionRecord,
    ExecutionRequest, PeerId, StdinRequest, StdinResponse,
};
use crate::notebook::{executions_ref, Notebook, LOCAL_ORIGIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

/// One keyed change observed on the executions map.
#[derive(Debug, Clone)]
pub struct ExecutionChange {
    pub exec_id: String,
    pub record: Option<ExecutionRecord>,
    pub action: ChangeAction,
}

#[derive(Clone)]
pub struct Coordinator {
    notebook: Notebook,
    peer_id: PeerId,
}

impl Coordinator {
    pub fn new(notebook: Notebook) -> Self {
        let peer_id = notebook.client_id();
        Self { notebook, peer_id }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn generate_exec_id(&self) -> String {
        generate_exec_id()
    }

    /// Create a full record with `status = requested`. This is the browser
    /// role; the monitor never calls it outside tests and embeddings.
    pub fn request_execution(&self, request: ExecutionRequest) -> String {
        let exec_id = generate_exec_id();
        let record = ExecutionRecord::requested(exec_id.clone(), request, self.peer_id);
        self.write_record(&record);
        exec_id
    }

    /// Attempt to claim a requested record. Returns false when the record
    /// is absent, no longer `requested`, or already carries a claimant.
    /// The write is optimistic; convergence may still award the claim to a
    /// concurrent peer, which a later read will reveal.
    pub fn claim_execution(&self, exec_id: &str) -> bool {
        self.notebook.with_doc_mut(|doc| {
            let map = executions_ref(doc);
            let mut txn = doc.transact_mut_with(LOCAL_ORIGIN);
            let Some(mut record) = map.get(&txn, exec_id).and_then(value_to_record) else {
                return false;
            };
            if record.status != ExecStatus::Requested || record.claimed_by.is_some() {
                return false;
            }
            record.status = ExecStatus::Claimed;
            record.claimed_by = Some(self.peer_id);
            record.claimed_at = Some(now_millis());
            map.insert(&mut txn, exec_id, record_to_any(&record));
            true
        })
    }

    /// True iff the converged record shows this peer as the claimant.
    pub fn owns_claim(&self, exec_id: &str) -> bool {
        self.execution(exec_id)
            .map(|record| record.is_claimed_by(self.peer_id))
            .unwrap_or(false)
    }

    /// Browser role: publish the freshly inserted output region and move
    /// the record from `claimed` to `ready`.
    pub fn set_output_block_ready(&self, exec_id: &str, position: &str) -> bool {
        self.update_record(exec_id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = ExecStatus::Ready;
            record.output_block_ready = true;
            record.output_position = Some(position.to_string());
            true
        })
    }

    pub fn set_running(&self, exec_id: &str) -> bool {
        self.update_record(exec_id, |record| {
            if record.status.is_terminal() || record.status == ExecStatus::Running {
                return false;
            }
            record.status = ExecStatus::Running;
            if record.started_at.is_none() {
                record.started_at = Some(now_millis());
            }
            true
        })
    }

    pub fn set_completed(
        &self,
        exec_id: &str,
        result: Option<JsonValue>,
        display_data: Vec<DisplayItem>,
    ) -> bool {
        self.update_record(exec_id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = ExecStatus::Completed;
            record.completed_at = Some(now_millis());
            record.result = result.clone();
            if !display_data.is_empty() {
                record.display_data = display_data.clone();
            }
            true
        })
    }

    pub fn set_error(&self, exec_id: &str, error: ExecError) -> bool {
        self.update_record(exec_id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = ExecStatus::Error;
            record.completed_at = Some(now_millis());
            record.error = Some(error.clone());
            true
        })
    }

    pub fn set_cancelled(&self, exec_id: &str) -> bool {
        self.update_record(exec_id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = ExecStatus::Cancelled;
            record.completed_at = Some(now_millis());
            true
        })
    }

    /// Monitor role: surface a runtime stdin prompt to browsers. Any stale
    /// response is dropped so the browser answers this prompt, not a
    /// previous one.
    pub fn request_stdin(&self, exec_id: &str, prompt: &str, password: bool) -> bool {
        self.update_record(exec_id, |record| {
            record.stdin_request = Some(StdinRequest {
                prompt: prompt.to_string(),
                password,
                requested_at: now_millis(),
            });
            record.stdin_response = None;
            true
        })
    }

    /// Browser role: answer the pending stdin prompt.
    pub fn respond_stdin(&self, exec_id: &str, text: &str) -> bool {
        self.update_record(exec_id, |record| {
            record.stdin_response = Some(StdinResponse {
                text: text.to_string(),
                responded_at: now_millis(),
            });
            true
        })
    }

    /// Monitor role: null both halves of the stdin channel once the text
    /// has been forwarded to the runtime.
    pub fn clear_stdin_request(&self, exec_id: &str) -> bool {
        self.update_record(exec_id, |record| {
            record.stdin_request = None;
            record.stdin_response = None;
            true
        })
    }

    pub fn add_display_data(&self, exec_id: &str, display: DisplayItem) -> bool {
        self.update_record(exec_id, |record| {
            record.display_data.push(display.clone());
            true
        })
    }

    pub fn execution(&self, exec_id: &str) -> Option<ExecutionRecord> {
        self.notebook.with_doc(|doc| {
            let map = executions_ref(doc);
            let txn = doc.transact();
            map.get(&txn, exec_id).and_then(value_to_record)
        })
    }

    pub fn executions_by_status(&self, status: ExecStatus) -> Vec<ExecutionRecord> {
        self.notebook.with_doc(|doc| {
            let map = executions_ref(doc);
            let txn = doc.transact();
            map.iter(&txn)
                .filter_map(|(_, value)| value_to_record(value))
                .filter(|record| record.status == status)
                .collect()
        })
    }

    /// Subscribe to keyed changes. The returned guard keeps the underlying
    /// observer registered; changes stop flowing once it is dropped.
    pub fn observe(
        &self,
    ) -> (
        Box<dyn std::any::Any>,
        mpsc::UnboundedReceiver<ExecutionChange>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.notebook.with_doc(|doc| {
            let mut map = executions_ref(doc);
            map.observe(move |txn, event| {
                for (key, change) in event.keys(txn).iter() {
                    let exec_id = key.to_string();
                    let action = match change {
                        EntryChange::Inserted(_) => ChangeAction::Add,
                        EntryChange::Updated(_, _) => ChangeAction::Update,
                        EntryChange::Removed(_) => ChangeAction::Delete,
                    };
                    let record = if action == ChangeAction::Delete {
                        None
                    } else {
                        event.target().get(txn, &exec_id).and_then(value_to_record)
                    };
                    let _ = tx.send(ExecutionChange {
                        exec_id,
                        record,
                        action,
                    });
                }
            })
        });
        (Box::new(subscription), rx)
    }

    fn write_record(&self, record: &ExecutionRecord) {
        self.notebook.with_doc_mut(|doc| {
            let map = executions_ref(doc);
            let mut txn = doc.transact_mut_with(LOCAL_ORIGIN);
            map.insert(&mut txn, record.id.as_str(), record_to_any(record));
        });
    }

    /// Read-modify-write of the whole record. The mutator returns false to
    /// leave the stored value untouched, which keeps repeated or
    /// out-of-order observations idempotent.
    fn update_record(&self, exec_id: &str, mutate: impl Fn(&mut ExecutionRecord) -> bool) -> bool {
        self.notebook.with_doc_mut(|doc| {
            let map = executions_ref(doc);
            let mut txn = doc.transact_mut_with(LOCAL_ORIGIN);
            let Some(mut record) = map.get(&txn, exec_id).and_then(value_to_record) else {
                debug!(exec_id, "update skipped: record not found");
                return false;
            };
            if !mutate(&mut record) {
                return false;
            }
            map.insert(&mut txn, exec_id, record_to_any(&record));
            true
        })
    }
}

fn value_to_record(value: Value) -> Option<ExecutionRecord> {
    let Value::Any(any) = value else {
        return None;
    };
    match serde_json::from_value(any_to_json(&any)) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(%err, "malformed execution record in shared map");
            None
        }
    }
}

fn record_to_any(record: &ExecutionRecord) -> Any {
    // Serialization of a plain struct with serde cannot fail.
    let value = serde_json::to_value(record).unwrap_or(JsonValue::Null);
    json_to_any(&value)
}

/// Conversion between the CRDT's plain value tree and JSON. Whole numbers
/// come back as JSON integers so integral fields survive the f64 the CRDT
/// stores all numbers as.
pub fn any_to_json(any: &Any) -> JsonValue {
    match any {
        Any::Null | Any::Undefined => JsonValue::Null,
        Any::Bool(value) => JsonValue::Bool(*value),
        Any::Number(value) => {
            if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
                JsonValue::from(*value as i64)
            } else {
                serde_json::Number::from_f64(*value)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
        }
        Any::BigInt(value) => JsonValue::from(*value),
        Any::String(value) => JsonValue::String(value.to_string()),
        Any::Buffer(bytes) => JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()),
        Any::Array(items) => JsonValue::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect(),
        ),
    }
}

pub fn json_to_any(value: &JsonValue) -> Any {
    match value {
        JsonValue::Null => Any::Null,
        JsonValue::Bool(b) => Any::Bool(*b),
        JsonValue::Number(number) => Any::Number(number.as_f64().unwrap_or(0.0)),
        JsonValue::String(s) => Any::String(s.as_str().into()),
        JsonValue::Array(items) => {
            let converted: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(converted.into())
        }
        JsonValue::Object(entries) => {
            let converted: HashMap<String, Any> = entries
                .iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect();
            Any::Map(converted.into())
        }
    }
}
