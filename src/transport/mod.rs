//! Websocket provider speaking the y-protocol.
//!
//! One socket per monitor process: the initial state-vector handshake, the
//! bidirectional update stream and the awareness channel all multiplex over
//! it. Updates applied from the server carry [`REMOTE_ORIGIN`] so the local
//! update subscription never echoes them back.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use y_sync::awareness::Awareness;
use y_sync::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Origin, ReadTxn, Transact, Update};

use crate::notebook::{Notebook, REMOTE_ORIGIN};

/// Awareness identity published for this peer.
#[derive(Debug, Clone)]
pub struct AwarenessUser {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Full room url: sync server base plus document path.
    pub url: String,
    pub user: AwarenessUser,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("sync protocol error: {0}")]
    Protocol(String),
}

/// A live connection to the sync server.
///
/// Dropping the session aborts its socket tasks; `close` does so
/// explicitly. `wait_synced` resolves once the initial handshake has
/// delivered the server's state.
pub struct SyncSession {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    synced_rx: watch::Receiver<bool>,
    closed_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    _update_subscription: Box<dyn std::any::Any>,
}

impl SyncSession {
    pub async fn connect(
        notebook: &Notebook,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let (socket, _response) = connect_async(&config.url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(url = %config.url, "websocket established");

        let awareness = notebook.awareness();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (synced_tx, synced_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        {
            let mut guard = awareness.write().unwrap();
            let state = json!({
                "user": {
                    "name": config.user.name,
                    "color": config.user.color,
                    "type": "monitor",
                }
            });
            guard.set_local_state(state.to_string());
        }

        // Handshake: our state vector, then our awareness presence.
        let step1 = {
            let guard = awareness.read().unwrap();
            let state_vector = guard.doc().transact().state_vector();
            Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
        };
        outbound_tx
            .send(step1)
            .map_err(|_| TransportError::Connect("socket closed during handshake".into()))?;
        {
            let guard = awareness.read().unwrap();
            match guard.update() {
                Ok(update) => {
                    let _ = outbound_tx.send(Message::Awareness(update).encode_v1());
                }
                Err(err) => debug!(%err, "no initial awareness update"),
            }
        }

        let update_subscription: Box<dyn std::any::Any> = {
            let update_tx = outbound_tx.clone();
            let subscription = notebook.with_doc(|doc| {
                doc.observe_update_v1(move |txn, event| {
                    let remote = Origin::from(REMOTE_ORIGIN);
                    let is_remote = txn
                        .origin()
                        .map(|origin| origin == &remote)
                        .unwrap_or(false);
                    if !is_remote {
                        let message =
                            Message::Sync(SyncMessage::Update(event.update.clone())).encode_v1();
                        let _ = update_tx.send(message);
                    }
                })
            });
            Box::new(subscription)
        };

        let (mut sink, mut stream) = socket.split();

        let send_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
        });

        let read_awareness = awareness.clone();
        let read_outbound = outbound_tx.clone();
        let read_task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let data = match message {
                    Ok(WsMessage::Binary(data)) => data,
                    Ok(WsMessage::Text(text)) => text.into_bytes(),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if let Err(err) =
                    handle_frame(&read_awareness, &read_outbound, &synced_tx, &data)
                {
                    warn!(%err, "dropping malformed sync frame");
                }
            }
            let _ = closed_tx.send(true);
        });

        // Periodic presence refresh so peers do not expire this client.
        let refresh_awareness = awareness.clone();
        let refresh_outbound = outbound_tx.clone();
        let refresh_task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(15));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let message = {
                    let guard = refresh_awareness.read().unwrap();
                    guard.update()
                };
                match message {
                    Ok(update) => {
                        if refresh_outbound
                            .send(Message::Awareness(update).encode_v1())
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => debug!(%err, "awareness refresh skipped"),
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            synced_rx,
            closed_rx,
            tasks: vec![send_task, read_task, refresh_task],
            _update_subscription: update_subscription,
        })
    }

    /// Wait for the initial sync exchange to complete. Returns false if
    /// the connection closed first.
    pub async fn wait_synced(&self) -> bool {
        let mut synced = self.synced_rx.clone();
        let mut closed = self.closed_rx.clone();
        loop {
            if *synced.borrow() {
                return true;
            }
            if *closed.borrow() {
                return false;
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return *synced.borrow();
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Resolves when the server connection has gone away.
    pub async fn closed(&self) {
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow() || self.outbound.is_closed()
    }

    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn handle_frame(
    awareness: &Arc<RwLock<Awareness>>,
    outbound: &mpsc::UnboundedSender<Vec<u8>>,
    synced: &watch::Sender<bool>,
    data: &[u8],
) -> Result<(), TransportError> {
    let message =
        Message::decode_v1(data).map_err(|err| TransportError::Protocol(err.to_string()))?;
    match message {
        Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
            let diff = {
                let guard = awareness.read().unwrap();
                let txn = guard.doc().transact();
                txn.encode_diff_v1(&state_vector)
            };
            let _ = outbound.send(Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1());
        }
        Message::Sync(SyncMessage::SyncStep2(update)) => {
            apply_remote_update(awareness, &update)?;
            let _ = synced.send(true);
        }
        Message::Sync(SyncMessage::Update(update)) => {
            apply_remote_update(awareness, &update)?;
        }
        Message::Awareness(update) => {
            let mut guard = awareness.write().unwrap();
            guard
                .apply_update(update)
                .map_err(|err| TransportError::Protocol(err.to_string()))?;
        }
        Message::AwarenessQuery => {
            let reply = {
                let guard = awareness.read().unwrap();
                guard.update()
            };
            if let Ok(update) = reply {
                let _ = outbound.send(Message::Awareness(update).encode_v1());
            }
        }
        _ => {}
    }
    Ok(())
}

fn apply_remote_update(
    awareness: &Arc<RwLock<Awareness>>,
    bytes: &[u8],
) -> Result<(), TransportError> {
    let update =
        Update::decode_v1(bytes).map_err(|err| TransportError::Protocol(err.to_string()))?;
    let guard = awareness.write().unwrap();
    let mut txn = guard.doc().transact_mut_with(REMOTE_ORIGIN);
    txn.apply_update(update);
    Ok(())
}
