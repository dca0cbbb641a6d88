//! The websocket provider against a miniature y-protocol server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mrmd_monitor::coordination::Coordinator;
use mrmd_monitor::model::execution::{ExecStatus, ExecutionRequest};
use mrmd_monitor::notebook::{content_ref, Notebook};
use mrmd_monitor::transport::{AwarenessUser, SyncSession, TransportConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use y_sync::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, Text, Transact, Update};

/// Accept one websocket client and speak the y-protocol over it, the way a
/// sync server would: step1 on connect, step2 replies, update broadcast.
/// Dropping (or firing) the returned sender tears the connection down.
async fn spawn_stub_server(notebook: Notebook) -> (String, tokio::sync::oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let (mut sink, mut reader) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Broadcast local doc changes to the connected client. The
        // registration intentionally outlives this task.
        let update_tx = outbound.clone();
        notebook.with_doc(|doc| {
            let subscription = doc.observe_update_v1(move |_txn, event| {
                let message =
                    Message::Sync(SyncMessage::Update(event.update.clone())).encode_v1();
                let _ = update_tx.send(message);
            });
            std::mem::forget(subscription);
        });

        let state_vector = notebook.with_doc(|doc| doc.transact().state_vector());
        let _ = outbound.send(Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1());

        let send_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            // Dropping the sink here closes the write half.
        });

        let read_loop = async {
            while let Some(Ok(message)) = reader.next().await {
                let data = match message {
                    WsMessage::Binary(data) => data,
                    WsMessage::Text(text) => text.into_bytes(),
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let Ok(decoded) = Message::decode_v1(&data) else {
                    continue;
                };
                match decoded {
                    Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                        let diff = notebook
                            .with_doc(|doc| doc.transact().encode_diff_v1(&state_vector));
                        let _ = outbound
                            .send(Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1());
                    }
                    Message::Sync(SyncMessage::SyncStep2(update))
                    | Message::Sync(SyncMessage::Update(update)) => {
                        notebook.with_doc_mut(|doc| {
                            let mut txn = doc.transact_mut();
                            if let Ok(update) = Update::decode_v1(&update) {
                                txn.apply_update(update);
                            }
                        });
                    }
                    _ => {}
                }
            }
        };

        tokio::select! {
            _ = &mut shutdown_rx => {}
            _ = read_loop => {}
        }
        // Both socket halves drop here, closing the connection.
        send_task.abort();
    });

    (format!("ws://{addr}/notebook.md"), shutdown_tx)
}

fn config(url: &str) -> TransportConfig {
    TransportConfig {
        url: url.to_string(),
        user: AwarenessUser {
            name: "mrmd-monitor".to_string(),
            color: "#10b981".to_string(),
        },
    }
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    condition()
}

fn server_content(notebook: &Notebook) -> String {
    notebook.with_doc(|doc| {
        let text = content_ref(doc);
        let txn = doc.transact();
        text.get_string(&txn)
    })
}

#[tokio::test]
async fn initial_sync_pulls_server_state() {
    let server = Notebook::with_client_id(500);
    server.with_doc_mut(|doc| {
        let text = content_ref(doc);
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "# seeded from the server\n");
    });
    let (url, _shutdown) = spawn_stub_server(server).await;

    let client = Notebook::with_client_id(9000);
    let session = SyncSession::connect(&client, &config(&url))
        .await
        .expect("connect");
    assert!(session.wait_synced().await, "initial sync must complete");
    assert!(session.is_synced());

    assert!(
        wait_until(Duration::from_secs(5), || {
            server_content(&client) == "# seeded from the server\n"
        })
        .await,
        "seeded content never reached the client"
    );
}

#[tokio::test]
async fn local_writes_replicate_to_the_server() {
    let server = Notebook::with_client_id(500);
    let (url, _shutdown) = spawn_stub_server(server.clone()).await;

    let client = Notebook::with_client_id(9000);
    let session = SyncSession::connect(&client, &config(&url))
        .await
        .expect("connect");
    assert!(session.wait_synced().await);

    let coordinator = Coordinator::new(client.clone());
    let exec_id = coordinator.request_execution(ExecutionRequest::new(
        "1 + 1",
        "python",
        "http://localhost:8787",
    ));

    let server_coord = Coordinator::new(server.clone());
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            server_coord
                .execution(&id)
                .map(|record| record.status == ExecStatus::Requested)
                .unwrap_or(false)
        })
        .await,
        "execution record never reached the server"
    );
}

#[tokio::test]
async fn server_edits_after_sync_stream_to_the_client() {
    let server = Notebook::with_client_id(500);
    let (url, _shutdown) = spawn_stub_server(server.clone()).await;

    let client = Notebook::with_client_id(9000);
    let session = SyncSession::connect(&client, &config(&url))
        .await
        .expect("connect");
    assert!(session.wait_synced().await);

    server.with_doc_mut(|doc| {
        let text = content_ref(doc);
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "late edit\n");
    });

    assert!(
        wait_until(Duration::from_secs(5), || {
            server_content(&client) == "late edit\n"
        })
        .await,
        "server edit never streamed to the client"
    );
}

#[tokio::test]
async fn dropped_server_marks_the_session_closed() {
    let server = Notebook::with_client_id(500);
    let (url, shutdown) = spawn_stub_server(server).await;

    let client = Notebook::with_client_id(9000);
    let session = SyncSession::connect(&client, &config(&url))
        .await
        .expect("connect");
    assert!(session.wait_synced().await);

    let _ = shutdown.send(());
    timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("session must observe the disconnect");
    assert!(session.is_closed());
}

#[tokio::test]
async fn connect_to_nothing_fails() {
    let client = Notebook::new();
    let result = SyncSession::connect(&client, &config("ws://127.0.0.1:1/doc")).await;
    assert!(result.is_err());
}
