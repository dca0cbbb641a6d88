//! End-to-end monitor scenarios: a browser peer and a monitor peer
//! replicate one notebook (bridged in-process), while a scripted runtime
//! serves the execution stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mrmd_monitor::coordination::Coordinator;
use mrmd_monitor::document::DocumentWriter;
use mrmd_monitor::model::execution::{ExecStatus, ExecutionRequest};
use mrmd_monitor::monitor::Monitor;
use mrmd_monitor::notebook::{content_ref, Notebook};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, Text, Transact, Update};

// ---------------------------------------------------------------------------
// Replication bridge between the browser doc and the monitor doc.

fn pump(from: &Notebook, to: &Notebook) {
    let state_vector = to.with_doc(|doc| doc.transact().state_vector());
    let diff = from.with_doc(|doc| doc.transact().encode_diff_v1(&state_vector));
    to.with_doc_mut(|doc| {
        let mut txn = doc.transact_mut();
        match Update::decode_v1(&diff) {
            Ok(update) => txn.apply_update(update),
            Err(err) => panic!("undecodable update: {err}"),
        }
    });
}

fn converge(a: &Notebook, b: &Notebook) {
    pump(a, b);
    pump(b, a);
    pump(a, b);
    pump(b, a);
}

fn spawn_bridge(a: Notebook, b: Notebook) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            converge(&a, &b);
            sleep(Duration::from_millis(20)).await;
        }
    })
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    condition()
}

// ---------------------------------------------------------------------------
// Scripted runtime stub.

enum Step {
    Emit(String),
    AwaitInput,
    Pause(Duration),
}

fn frame(event: &str, data: &str) -> Step {
    Step::Emit(format!("event: {event}\ndata: {data}\n\n"))
}

struct StubRuntime {
    base_url: String,
    inputs: Arc<Mutex<Vec<Value>>>,
    interrupts: Arc<AtomicUsize>,
}

async fn spawn_stub_runtime(steps: Vec<Step>) -> StubRuntime {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let inputs: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let interrupts = Arc::new(AtomicUsize::new(0));
    let input_notify = Arc::new(Notify::new());
    let script = Arc::new(Mutex::new(Some(steps)));

    let conn_inputs = inputs.clone();
    let conn_interrupts = interrupts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let inputs = conn_inputs.clone();
            let interrupts = conn_interrupts.clone();
            let notify = input_notify.clone();
            let script = script.clone();
            tokio::spawn(async move {
                handle_connection(stream, inputs, interrupts, notify, script).await;
            });
        }
    });

    StubRuntime {
        base_url: format!("http://{addr}"),
        inputs,
        interrupts,
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    inputs: Arc<Mutex<Vec<Value>>>,
    interrupts: Arc<AtomicUsize>,
    input_notify: Arc<Notify>,
    script: Arc<Mutex<Option<Vec<Step>>>>,
) {
    let Some((path, body)) = read_request(&mut stream).await else {
        return;
    };
    match path.as_str() {
        "/execute/stream" => {
            let Some(steps) = script.lock().unwrap().take() else {
                respond_json(&mut stream, "{\"error\":\"script exhausted\"}").await;
                return;
            };
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
                )
                .await
                .ok();
            for step in steps {
                match step {
                    Step::Emit(frame) => {
                        if stream.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                        stream.flush().await.ok();
                    }
                    Step::AwaitInput => input_notify.notified().await,
                    Step::Pause(duration) => sleep(duration).await,
                }
            }
        }
        "/input" => {
            if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                inputs.lock().unwrap().push(value);
            }
            input_notify.notify_one();
            respond_json(&mut stream, "{\"accepted\":true}").await;
        }
        "/interrupt" => {
            interrupts.fetch_add(1, Ordering::SeqCst);
            respond_json(&mut stream, "{\"interrupted\":true}").await;
        }
        _ => {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .ok();
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            return None;
        }
    }
    let head_text = String::from_utf8_lossy(&head);
    let path = head_text.split_whitespace().nth(1)?.to_string();
    let content_length = head_text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut body).await.ok()?;
    }
    Some((path, body))
}

async fn respond_json(stream: &mut TcpStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await.ok();
}

// ---------------------------------------------------------------------------
// Browser-side actions.

fn insert_output_block(browser: &Notebook, exec_id: &str) -> String {
    let block = format!("```output:{exec_id}\n```\n");
    browser.with_doc_mut(|doc| {
        let text = content_ref(doc);
        let mut txn = doc.transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, &block);
    });
    DocumentWriter::new(browser.clone())
        .create_output_position(exec_id)
        .expect("output position")
}

struct Harness {
    browser: Notebook,
    browser_coord: Coordinator,
    browser_writer: DocumentWriter,
    _monitor: Monitor,
    _bridge: tokio::task::JoinHandle<()>,
}

fn harness() -> Harness {
    let browser = Notebook::with_client_id(1);
    let monitor_doc = Notebook::with_client_id(7000);

    let mut monitor = Monitor::attach(monitor_doc.clone(), None).expect("attach monitor");
    monitor.spawn_runner().expect("runner");

    let bridge = spawn_bridge(browser.clone(), monitor_doc);
    Harness {
        browser_coord: Coordinator::new(browser.clone()),
        browser_writer: DocumentWriter::new(browser.clone()),
        browser,
        _monitor: monitor,
        _bridge: bridge,
    }
}

async fn request_and_ready(harness: &Harness, runtime_url: &str) -> String {
    let exec_id = harness.browser_coord.request_execution(ExecutionRequest::new(
        "print('hi')",
        "python",
        runtime_url,
    ));

    let coord = harness.browser_coord.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            coord
                .execution(&id)
                .map(|record| record.status == ExecStatus::Claimed)
                .unwrap_or(false)
        })
        .await,
        "monitor never claimed the execution"
    );

    let position = insert_output_block(&harness.browser, &exec_id);
    assert!(harness
        .browser_coord
        .set_output_block_ready(&exec_id, &position));
    exec_id
}

async fn wait_for_status(harness: &Harness, exec_id: &str, status: ExecStatus) {
    let coord = harness.browser_coord.clone();
    let id = exec_id.to_string();
    assert!(
        wait_until(Duration::from_secs(10), move || {
            coord
                .execution(&id)
                .map(|record| record.status == status)
                .unwrap_or(false)
        })
        .await,
        "record never reached {status}"
    );
}

// ---------------------------------------------------------------------------
// Scenarios.

#[tokio::test]
async fn happy_path_streams_output_into_the_document() {
    let runtime = spawn_stub_runtime(vec![
        frame("start", "{}"),
        frame("stdout", "{\"content\":\"hi\\n\"}"),
        frame("result", "{\"success\":true}"),
        frame("done", "{}"),
    ])
    .await;

    let harness = harness();
    let exec_id = request_and_ready(&harness, &runtime.base_url).await;
    wait_for_status(&harness, &exec_id, ExecStatus::Completed).await;

    let record = harness.browser_coord.execution(&exec_id).unwrap();
    assert_eq!(record.result, Some(serde_json::json!({"success": true})));
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());

    let writer = harness.browser_writer.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            writer.output_content(&id).as_deref() == Some("hi\n")
        })
        .await,
        "projected output never converged to the browser"
    );
}

#[tokio::test]
async fn progress_bar_rewrites_collapse_to_one_line() {
    let mut steps = vec![frame("start", "{}")];
    for i in 0..100usize {
        let hashes = (i + 1) * 10 / 100;
        let bar: String = std::iter::repeat('#')
            .take(hashes)
            .chain(std::iter::repeat(' ').take(10 - hashes))
            .collect();
        let chunk = format!("\\r[{bar}] {i}%");
        steps.push(frame("stdout", &format!("{{\"content\":\"{chunk}\"}}")));
    }
    steps.push(frame("result", "{\"success\":true}"));
    steps.push(frame("done", "{}"));
    let runtime = spawn_stub_runtime(steps).await;

    let harness = harness();
    let exec_id = request_and_ready(&harness, &runtime.base_url).await;
    wait_for_status(&harness, &exec_id, ExecStatus::Completed).await;

    let writer = harness.browser_writer.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            writer.output_content(&id).as_deref() == Some("[##########] 99%\n")
        })
        .await,
        "progress bar did not collapse to a single line"
    );
}

#[tokio::test]
async fn stdin_round_trip_forwards_and_clears() {
    let runtime = spawn_stub_runtime(vec![
        frame("start", "{}"),
        frame("stdin_request", "{\"prompt\":\"Name: \",\"password\":false}"),
        Step::AwaitInput,
        frame("stdout", "{\"content\":\"Hello Alice\\n\"}"),
        frame("result", "{\"success\":true}"),
        frame("done", "{}"),
    ])
    .await;

    let harness = harness();
    let exec_id = request_and_ready(&harness, &runtime.base_url).await;

    // The prompt surfaces on the shared record.
    let coord = harness.browser_coord.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            coord
                .execution(&id)
                .and_then(|record| record.stdin_request)
                .map(|request| request.prompt == "Name: " && !request.password)
                .unwrap_or(false)
        })
        .await,
        "stdin request never reached the browser"
    );

    assert!(harness.browser_coord.respond_stdin(&exec_id, "Alice\n"));
    wait_for_status(&harness, &exec_id, ExecStatus::Completed).await;

    let inputs = runtime.inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0]["text"], "Alice\n");
    assert_eq!(inputs[0]["session"], "default");
    assert_eq!(inputs[0]["exec_id"], exec_id.as_str());

    // Both halves of the stdin channel end null.
    let coord = harness.browser_coord.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            coord
                .execution(&id)
                .map(|record| record.stdin_request.is_none() && record.stdin_response.is_none())
                .unwrap_or(false)
        })
        .await,
        "stdin fields were not cleared"
    );
}

#[tokio::test]
async fn missing_output_region_ends_in_sync_error() {
    let runtime = spawn_stub_runtime(vec![frame("done", "{}")]).await;

    let harness = harness();
    let exec_id = harness.browser_coord.request_execution(ExecutionRequest::new(
        "print('hi')",
        "python",
        &runtime.base_url,
    ));

    let coord = harness.browser_coord.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            coord
                .execution(&id)
                .map(|record| record.status == ExecStatus::Claimed)
                .unwrap_or(false)
        })
        .await
    );

    // Ready is announced but the fenced block never materializes.
    assert!(harness
        .browser_coord
        .set_output_block_ready(&exec_id, "bm90LWEtcmVhbC1wb3NpdGlvbg=="));

    let coord = harness.browser_coord.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(8), move || {
            coord
                .execution(&id)
                .map(|record| record.status == ExecStatus::Error)
                .unwrap_or(false)
        })
        .await,
        "missing output region must fail the execution"
    );

    let record = harness.browser_coord.execution(&exec_id).unwrap();
    assert_eq!(record.error.as_ref().map(|error| error.kind.as_str()), Some("SyncError"));
}

#[tokio::test]
async fn peer_cancellation_stops_the_stream_and_interrupts() {
    let runtime = spawn_stub_runtime(vec![
        frame("start", "{}"),
        frame("stdout", "{\"content\":\"tick\\n\"}"),
        Step::Pause(Duration::from_secs(60)),
    ])
    .await;

    let harness = harness();
    let exec_id = request_and_ready(&harness, &runtime.base_url).await;

    // Wait until the stream is producing before cancelling.
    let writer = harness.browser_writer.clone();
    let id = exec_id.clone();
    assert!(
        wait_until(Duration::from_secs(10), move || {
            writer.output_content(&id).as_deref() == Some("tick\n")
        })
        .await,
        "stream output never arrived"
    );

    assert!(harness.browser_coord.set_cancelled(&exec_id));
    wait_for_status(&harness, &exec_id, ExecStatus::Cancelled).await;

    let interrupts = runtime.interrupts.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            interrupts.load(Ordering::SeqCst) == 1
        })
        .await,
        "runtime session was never interrupted"
    );

    // Terminal state is absorbing: the drive's own abort handling must not
    // rewrite the record.
    sleep(Duration::from_millis(300)).await;
    let record = harness.browser_coord.execution(&exec_id).unwrap();
    assert_eq!(record.status, ExecStatus::Cancelled);
}
