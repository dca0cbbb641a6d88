//! The monitor loop: observe coordination changes, claim requested
//! executions, drive them against their runtimes and reflect every event
//! back into the shared document.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::coordination::{Coordinator, ExecutionChange};
use crate::document::DocumentWriter;
use crate::model::execution::{DisplayItem, ExecError, ExecStatus, ExecutionRecord};
use crate::notebook::Notebook;
use crate::runtime::{
    ExecOutcome, ExecuteOptions, ExecutionObserver, RuntimeClient, RuntimeError, StdinPrompt,
};
use crate::terminal::TerminalProjector;
use crate::transport::{AwarenessUser, SyncSession, TransportConfig, TransportError};

/// How long the monitor waits for the browser's output region to converge
/// after a record turns `ready`: 50 polls at 100 ms.
const OUTPUT_BLOCK_POLL_ATTEMPTS: u32 = 50;
const OUTPUT_BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sync server base url (`ws://` or `wss://`).
    pub sync_url: String,
    /// Room / document name appended to the base url.
    pub doc_name: String,
    pub user: AwarenessUser,
}

impl MonitorConfig {
    pub fn room_url(&self) -> String {
        format!(
            "{}/{}",
            self.sync_url.trim_end_matches('/'),
            self.doc_name
        )
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("initial sync did not complete before the connection closed")]
    SyncIncomplete,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// One monitor peer bound to one notebook document.
pub struct Monitor {
    inner: MonitorInner,
    session: Option<SyncSession>,
    changes: Option<UnboundedReceiver<ExecutionChange>>,
    _observer_guard: Box<dyn std::any::Any>,
}

impl Monitor {
    /// Connect the transport, await the first synced signal, install the
    /// coordination observer and scan existing records for work.
    pub async fn connect(notebook: Notebook, config: &MonitorConfig) -> Result<Self, MonitorError> {
        let transport = TransportConfig {
            url: config.room_url(),
            user: config.user.clone(),
        };
        let session = SyncSession::connect(&notebook, &transport).await?;
        if !session.wait_synced().await {
            return Err(MonitorError::SyncIncomplete);
        }
        info!(room = %transport.url, "initial sync complete");
        Self::attach(notebook, Some(session))
    }

    /// Install the monitor over an already-synced notebook. Embedders and
    /// tests that replicate the doc by other means use this directly.
    pub fn attach(notebook: Notebook, session: Option<SyncSession>) -> Result<Self, MonitorError> {
        let coordinator = Coordinator::new(notebook.clone());
        let writer = DocumentWriter::new(notebook);
        let runtime = Arc::new(RuntimeClient::new()?);
        let (observer_guard, changes) = coordinator.observe();

        let inner = MonitorInner {
            coordinator,
            writer,
            runtime,
            processing: Arc::new(Mutex::new(HashSet::new())),
            driving: Arc::new(Mutex::new(HashSet::new())),
            forwarded_stdin: Arc::new(Mutex::new(HashSet::new())),
        };
        inner.reconcile_existing();

        Ok(Self {
            inner,
            session,
            changes: Some(changes),
            _observer_guard: observer_guard,
        })
    }

    /// Consume coordination changes until the receiver or the transport
    /// goes away.
    pub async fn run(&mut self) -> Result<(), MonitorError> {
        let Some(changes) = self.changes.take() else {
            return Ok(());
        };
        let inner = self.inner.clone();
        tokio::select! {
            _ = run_changes(inner, changes) => {}
            _ = Self::session_closed(&self.session) => {
                warn!("sync connection closed");
            }
        }
        Ok(())
    }

    /// Drive the change loop on a background task. Embedders that keep the
    /// `Monitor` around for `disconnect` use this instead of [`Monitor::run`].
    pub fn spawn_runner(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        let changes = self.changes.take()?;
        let inner = self.inner.clone();
        Some(tokio::spawn(run_changes(inner, changes)))
    }

    async fn session_closed(session: &Option<SyncSession>) {
        match session {
            Some(session) => session.closed().await,
            None => std::future::pending().await,
        }
    }

    /// Cancel in-flight executions, remove the observer and close the
    /// transport.
    pub async fn disconnect(&mut self) {
        self.inner.runtime.cancel_all();
        self.changes = None;
        self._observer_guard = Box::new(());
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.is_synced() && !session.is_closed())
            .unwrap_or(false)
    }

    pub fn active_executions(&self) -> usize {
        self.inner.runtime.active_count()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }
}

async fn run_changes(
    inner: MonitorInner,
    mut changes: UnboundedReceiver<ExecutionChange>,
) {
    while let Some(change) = changes.recv().await {
        inner.handle_change(change).await;
    }
}

#[derive(Clone)]
struct MonitorInner {
    coordinator: Coordinator,
    writer: DocumentWriter,
    runtime: Arc<RuntimeClient>,
    /// Claim guard: ids this process is working on, held from the claim
    /// attempt until the drive releases them.
    processing: Arc<Mutex<HashSet<String>>>,
    /// Drive guard: ids with a spawned execution drive, set before the
    /// drive task starts so rapid observer firings cannot double-spawn.
    driving: Arc<Mutex<HashSet<String>>>,
    /// Stdin responses already forwarded, keyed by response timestamp.
    /// Observer snapshots taken before `clear_stdin_request` lands would
    /// otherwise forward the same response twice.
    forwarded_stdin: Arc<Mutex<HashSet<(String, i64)>>>,
}

impl MonitorInner {
    /// Startup reconciliation: claim anything still `requested`; resume
    /// `ready` records this peer already claimed (a quick restart between
    /// claim and run). Records a crashed instance left `running` are not
    /// resumed.
    fn reconcile_existing(&self) {
        for record in self
            .coordinator
            .executions_by_status(ExecStatus::Requested)
        {
            self.try_claim(&record.id);
        }
        for record in self.coordinator.executions_by_status(ExecStatus::Ready) {
            if record.is_claimed_by(self.coordinator.peer_id()) {
                self.processing.lock().unwrap().insert(record.id.clone());
                self.maybe_begin(record);
            }
        }
    }

    async fn handle_change(&self, change: ExecutionChange) {
        let Some(record) = change.record else {
            return;
        };
        match record.status {
            ExecStatus::Requested => self.try_claim(&record.id),
            ExecStatus::Ready => {
                if record.is_claimed_by(self.coordinator.peer_id()) {
                    self.maybe_begin(record.clone());
                }
            }
            ExecStatus::Cancelled => self.handle_remote_cancel(&record).await,
            _ => {}
        }
        if record.stdin_response.is_some() && record.is_claimed_by(self.coordinator.peer_id()) {
            self.forward_stdin(&record).await;
        }
    }

    fn try_claim(&self, exec_id: &str) {
        {
            let mut processing = self.processing.lock().unwrap();
            if !processing.insert(exec_id.to_string()) {
                return;
            }
        }
        if self.coordinator.claim_execution(exec_id) && self.coordinator.owns_claim(exec_id) {
            info!(exec_id, "claimed execution");
        } else {
            debug!(exec_id, "claim unavailable or lost");
            self.processing.lock().unwrap().remove(exec_id);
        }
    }

    fn maybe_begin(&self, record: ExecutionRecord) {
        if self.runtime.is_active(&record.id) {
            return;
        }
        if !self.driving.lock().unwrap().insert(record.id.clone()) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            inner.drive(record).await;
        });
    }

    async fn drive(&self, record: ExecutionRecord) {
        let exec_id = record.id.clone();
        self.drive_execution(&record).await;
        self.driving.lock().unwrap().remove(&exec_id);
        self.processing.lock().unwrap().remove(&exec_id);
    }

    async fn drive_execution(&self, record: &ExecutionRecord) {
        let exec_id = &record.id;

        if !self.wait_for_output_block(exec_id).await {
            warn!(exec_id, "output block never converged");
            self.coordinator.set_error(
                exec_id,
                ExecError::sync("output block did not appear in the document"),
            );
            return;
        }

        self.coordinator.set_running(exec_id);
        info!(exec_id, runtime_url = %record.runtime_url, "execution started");

        let observer = DriveObserver::new(
            exec_id.clone(),
            self.coordinator.clone(),
            self.writer.clone(),
        );
        let options = ExecuteOptions {
            session: record.session.clone(),
            exec_id: exec_id.clone(),
        };
        let outcome = self
            .runtime
            .execute(&record.runtime_url, &record.code, options, &observer)
            .await;

        match outcome {
            Ok(ExecOutcome::Completed(result)) => {
                // Normally `on_result` already moved the record to
                // completed; streams that close without a result event
                // settle here.
                self.coordinator
                    .set_completed(exec_id, result, observer.displays());
                info!(exec_id, "execution completed");
            }
            Ok(ExecOutcome::Failed(error)) => {
                debug!(exec_id, kind = %error.kind, "runtime reported failure");
            }
            Ok(ExecOutcome::Aborted) => {
                info!(exec_id, "execution cancelled locally");
                self.coordinator.set_cancelled(exec_id);
            }
            Err(err) => {
                warn!(exec_id, %err, "execution stream failed");
                self.coordinator.set_error(exec_id, err.to_exec_error());
            }
        }
    }

    async fn wait_for_output_block(&self, exec_id: &str) -> bool {
        for _ in 0..OUTPUT_BLOCK_POLL_ATTEMPTS {
            if self.writer.has_output_block(exec_id) {
                return true;
            }
            sleep(OUTPUT_BLOCK_POLL_INTERVAL).await;
        }
        false
    }

    async fn forward_stdin(&self, record: &ExecutionRecord) {
        let Some(response) = &record.stdin_response else {
            return;
        };
        {
            let mut forwarded = self.forwarded_stdin.lock().unwrap();
            if !forwarded.insert((record.id.clone(), response.responded_at)) {
                return;
            }
        }
        match self
            .runtime
            .send_input(
                &record.runtime_url,
                &record.session,
                &record.id,
                &response.text,
            )
            .await
        {
            Ok(reply) => {
                debug!(exec_id = %record.id, %reply, "stdin forwarded");
                self.coordinator.clear_stdin_request(&record.id);
            }
            Err(err) => {
                warn!(exec_id = %record.id, %err, "stdin forward failed");
            }
        }
    }

    /// A browser wrote `cancelled` into a record this peer claimed: stop
    /// the local stream and interrupt the runtime session, since local
    /// cancellation alone is advisory.
    async fn handle_remote_cancel(&self, record: &ExecutionRecord) {
        if !record.is_claimed_by(self.coordinator.peer_id()) {
            return;
        }
        if !self.runtime.is_active(&record.id) {
            return;
        }
        info!(exec_id = %record.id, "cancellation requested by peer");
        self.runtime.cancel(&record.id);
        if let Err(err) = self
            .runtime
            .interrupt(&record.runtime_url, &record.session)
            .await
        {
            warn!(exec_id = %record.id, %err, "runtime interrupt failed");
        }
    }
}

/// Bridges one execution's stream events into record updates and document
/// edits. A fresh projector per execution keeps projections independent.
struct DriveObserver {
    exec_id: String,
    coordinator: Coordinator,
    writer: DocumentWriter,
    projector: Mutex<TerminalProjector>,
    displays: Mutex<Vec<DisplayItem>>,
}

impl DriveObserver {
    fn new(exec_id: String, coordinator: Coordinator, writer: DocumentWriter) -> Self {
        Self {
            exec_id,
            coordinator,
            writer,
            projector: Mutex::new(TerminalProjector::new()),
            displays: Mutex::new(Vec::new()),
        }
    }

    fn displays(&self) -> Vec<DisplayItem> {
        self.displays.lock().unwrap().clone()
    }

    fn project(&self, chunk: &str) {
        let snapshot = {
            let mut projector = self.projector.lock().unwrap();
            projector.write(chunk);
            projector.snapshot()
        };
        // Keep the closing fence on its own line for non-empty output.
        let content = if snapshot.is_empty() {
            String::new()
        } else {
            format!("{snapshot}\n")
        };
        if !self.writer.replace_output(&self.exec_id, &content) {
            warn!(exec_id = %self.exec_id, "output region vanished mid-stream");
        }
    }
}

impl ExecutionObserver for DriveObserver {
    fn on_stdout(&self, chunk: &str, _accumulated: &str) {
        self.project(chunk);
    }

    fn on_stderr(&self, chunk: &str, _accumulated: &str) {
        self.project(chunk);
    }

    fn on_stdin_request(&self, request: &StdinPrompt) {
        self.coordinator
            .request_stdin(&self.exec_id, &request.prompt, request.password);
    }

    fn on_display(&self, display: &DisplayItem) {
        self.displays.lock().unwrap().push(display.clone());
        self.coordinator.add_display_data(&self.exec_id, display.clone());
    }

    fn on_result(&self, result: &serde_json::Value) {
        self.coordinator
            .set_completed(&self.exec_id, Some(result.clone()), self.displays());
    }

    fn on_error(&self, error: &ExecError) {
        self.coordinator.set_error(&self.exec_id, error.clone());
    }
}
