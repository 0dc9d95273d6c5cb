//! Full-stack tests: a `codex-bridge` server process wired to the
//! `mock-app-server` child, driven over HTTP.

use std::io;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

static TEST_DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

struct BridgeHandle {
    child: Child,
    base_url: String,
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_bridge(max_sessions: usize) -> io::Result<BridgeHandle> {
    let port = pick_port()?;
    let base_url = format!("http://127.0.0.1:{port}");
    let nonce = TEST_DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    let data_dir = std::env::temp_dir().join(format!(
        "codex-bridge-e2e-{}-{nonce}",
        std::process::id()
    ));

    let child = Command::new(env!("CARGO_BIN_EXE_codex-bridge"))
        .env("HOST", "127.0.0.1")
        .env("PORT", port.to_string())
        .env("OPENAI_API_KEY", "test-key")
        .env(
            "CODEX_BINARY_PATH",
            PathBuf::from(env!("CARGO_BIN_EXE_mock-app-server")),
        )
        .env("BASE_DATA_DIR", &data_dir)
        .env("MAX_SESSIONS", max_sessions.to_string())
        .env("IDLE_TIMEOUT_SECONDS", "600")
        .env("CLEANUP_INTERVAL_SECONDS", "60")
        .env("TURN_TIMEOUT_SECONDS", "10")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()?;

    Ok(BridgeHandle { child, base_url })
}

fn pick_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn wait_for_ready(base_url: &str) -> io::Result<()> {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "bridge did not become ready",
            ));
        }
        if let Ok(response) = client.get(format!("{base_url}/status")).send().await {
            if response.status() == StatusCode::OK {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn root_and_status_report_configuration() {
    let bridge = spawn_bridge(8).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let root: Value = client
        .get(format!("{}/", bridge.base_url))
        .send()
        .await
        .expect("root")
        .json()
        .await
        .expect("root json");
    assert_eq!(root["name"], "Codex API Bridge");
    assert!(root["endpoints"]["POST /chat"].is_string());

    let status: Value = client
        .get(format!("{}/status", bridge.base_url))
        .send()
        .await
        .expect("status")
        .json()
        .await
        .expect("status json");
    assert_eq!(status["status"], "ok");
    assert_eq!(status["codex_available"], true);
    assert_eq!(status["api_key_configured"], true);
    assert_eq!(status["codex_version"], "codex-cli 0.0.0-mock");
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let bridge = spawn_bridge(8).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let response = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({"messages": [{"content": ""}]}))
        .send()
        .await
        .expect("post chat");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("body");
    assert_eq!(body["detail"], "Empty message");
}

#[tokio::test]
async fn unknown_thread_is_a_404_before_any_write() {
    let bridge = spawn_bridge(8).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let response = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "thread_id": "invalid-id",
            "messages": [{"content": "hi"}],
        }))
        .send()
        .await
        .expect("post chat");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("body");
    assert_eq!(body["detail"], "Thread not found: invalid-id");
}

#[tokio::test]
async fn non_streaming_chat_then_history_round_trip() {
    let bridge = spawn_bridge(8).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let response = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "messages": [{"content": "What is 2+2?"}],
            "stream": false,
        }))
        .send()
        .await
        .expect("post chat");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.expect("body");

    let thread_id = body["thread_id"].as_str().expect("thread_id");
    assert!(!thread_id.is_empty());
    assert_eq!(body["message"], "mock: What is 2+2?");

    let events = body["events"].as_array().expect("events");
    let completions = events
        .iter()
        .filter(|event| event["method"] == "turn/completed")
        .count();
    assert_eq!(completions, 1);

    // The deltas concatenate to the aggregated message.
    let deltas: String = events
        .iter()
        .filter(|event| event["method"] == "item/agentMessage/delta")
        .filter_map(|event| event["params"]["delta"].as_str())
        .collect();
    assert_eq!(deltas, "mock: What is 2+2?");

    let history: Value = client
        .get(format!(
            "{}/history?thread_id={thread_id}",
            bridge.base_url
        ))
        .send()
        .await
        .expect("history")
        .json()
        .await
        .expect("history json");
    assert_eq!(history["thread_id"], thread_id);
    let turns = history["turns"].as_array().expect("turns");
    let last_agent_text = turns
        .last()
        .and_then(|turn| turn["items"].as_array())
        .and_then(|items| {
            items
                .iter()
                .find(|item| item["type"] == "agentMessage")
                .and_then(|item| item["text"].as_str())
        })
        .expect("agent message in history");
    assert_eq!(last_agent_text, body["message"]);

    let threads: Value = client
        .get(format!("{}/threads", bridge.base_url))
        .send()
        .await
        .expect("threads")
        .json()
        .await
        .expect("threads json");
    let listed = threads["threads"]
        .as_array()
        .expect("threads array")
        .iter()
        .any(|thread| thread["thread_id"] == thread_id);
    assert!(listed, "created thread missing from /threads");
}

#[tokio::test]
async fn streaming_frames_are_ordered_and_match_aggregation() {
    let bridge = spawn_bridge(8).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let response = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({"messages": [{"content": "hello there"}]}))
        .send()
        .await
        .expect("post chat");
    assert_eq!(response.status(), StatusCode::OK);

    let mut sse = SseReader::new(response);
    let mut frames = Vec::new();
    loop {
        let data = sse
            .next_data(Duration::from_secs(5))
            .await
            .expect("sse frame");
        if data == "[DONE]" {
            break;
        }
        frames.push(serde_json::from_str::<Value>(&data).expect("frame json"));
    }

    let first = frames.first().expect("session frame");
    assert_eq!(first["type"], "session");
    let thread_id = first["thread_id"].as_str().expect("thread_id").to_string();

    let last = frames.last().expect("terminal frame");
    assert_eq!(last["method"], "turn/completed");
    assert_eq!(last["params"]["conversationId"], thread_id.as_str());

    let streamed: String = frames
        .iter()
        .filter(|frame| frame["method"] == "item/agentMessage/delta")
        .filter_map(|frame| frame["params"]["delta"].as_str())
        .collect();

    // Aggregation over the same upstream fixture derives the same message.
    let aggregated: Value = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "messages": [{"content": "hello there"}],
            "stream": false,
        }))
        .send()
        .await
        .expect("post chat")
        .json()
        .await
        .expect("body");
    assert_eq!(aggregated["message"], streamed.as_str());
}

#[tokio::test]
async fn thread_id_continues_the_same_conversation() {
    let bridge = spawn_bridge(8).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let first: Value = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({"messages": [{"content": "first"}], "stream": false}))
        .send()
        .await
        .expect("chat 1")
        .json()
        .await
        .expect("body 1");
    let thread_id = first["thread_id"].as_str().expect("thread_id");

    let second: Value = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "thread_id": thread_id,
            "messages": [{"content": "second"}],
            "stream": false,
        }))
        .send()
        .await
        .expect("chat 2")
        .json()
        .await
        .expect("body 2");
    assert_eq!(second["thread_id"], thread_id);

    let history: Value = client
        .get(format!(
            "{}/history?thread_id={thread_id}",
            bridge.base_url
        ))
        .send()
        .await
        .expect("history")
        .json()
        .await
        .expect("history json");
    assert_eq!(history["turns"].as_array().expect("turns").len(), 2);
}

#[tokio::test]
async fn capacity_rejects_second_user_and_keeps_the_first() {
    let bridge = spawn_bridge(1).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let first = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "user_id": "user-a",
            "messages": [{"content": "hi"}],
            "stream": false,
        }))
        .send()
        .await
        .expect("chat a");
    assert_eq!(first.status(), StatusCode::OK);

    let rejected = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "user_id": "user-b",
            "messages": [{"content": "hi"}],
            "stream": false,
        }))
        .send()
        .await
        .expect("chat b");
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);

    let again = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "user_id": "user-a",
            "messages": [{"content": "again"}],
            "stream": false,
        }))
        .send()
        .await
        .expect("chat a again");
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_turn_surfaces_upstream_reason() {
    let bridge = spawn_bridge(8).expect("spawn bridge");
    wait_for_ready(&bridge.base_url).await.expect("ready");
    let client = Client::new();

    let response = client
        .post(format!("{}/chat", bridge.base_url))
        .json(&json!({
            "messages": [{"content": "please fail now"}],
            "stream": false,
        }))
        .send()
        .await
        .expect("post chat");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.expect("body");
    assert!(
        body["detail"]
            .as_str()
            .unwrap_or_default()
            .contains("mock turn failure"),
        "detail: {}",
        body["detail"]
    );
}

struct SseReader {
    stream: futures::stream::BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
    buffer: Vec<u8>,
}

impl SseReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: Vec::new(),
        }
    }

    async fn next_data(&mut self, timeout: Duration) -> io::Result<String> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(data) = self.try_parse_block()? {
                return Ok(data);
            }

            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for sse frame",
                ));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = tokio::time::timeout(remaining, self.stream.next())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out reading sse"))?;

            match chunk {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    return Err(io::Error::other(format!("sse stream error: {err}")));
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "sse stream ended",
                    ));
                }
            }
        }
    }

    /// Pops the next complete `\n\n`-delimited block with a `data:` line;
    /// keep-alive comment blocks are skipped.
    fn try_parse_block(&mut self) -> io::Result<Option<String>> {
        loop {
            let split = self
                .buffer
                .windows(2)
                .position(|window| window == b"\n\n");
            let Some(idx) = split else {
                return Ok(None);
            };

            let block = self.buffer.drain(..idx + 2).collect::<Vec<_>>();
            let text = String::from_utf8_lossy(&block);
            let data = text
                .lines()
                .filter_map(|line| line.strip_prefix("data: "))
                .collect::<Vec<_>>()
                .join("\n");

            if !data.is_empty() {
                return Ok(Some(data));
            }
        }
    }
}
