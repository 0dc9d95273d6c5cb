use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

const STDERR_RING_BYTES: usize = 8 * 1024;
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to spawn subprocess `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture subprocess stdin")]
    MissingStdin,
    #[error("failed to capture subprocess stdout")]
    MissingStdout,
    #[error("failed to capture subprocess stderr")]
    MissingStderr,
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write subprocess stdin: {0}")]
    Write(std::io::Error),
    #[error("json-rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("agent transport failed: {message}")]
    Transport {
        message: String,
        stderr_tail: Option<String>,
    },
}

impl RpcError {
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Write(_))
    }

    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            Self::Transport { stderr_tail, .. } => stderr_tail.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Running,
    ClosedClean,
    ClosedError,
}

/// How to launch the child process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// How long `close()` waits for the child to exit before killing it.
    pub close_grace: Duration,
    /// Queue depth of each notification subscriber.
    pub subscriber_capacity: usize,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            close_grace: DEFAULT_CLOSE_GRACE,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

struct SubscriberEntry {
    id: u64,
    conversation_id: String,
    tx: mpsc::Sender<Value>,
}

struct Shared {
    pending: std::sync::Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>,
    subscribers: std::sync::Mutex<Vec<SubscriberEntry>>,
    reader_state: std::sync::Mutex<ReaderState>,
    stderr_ring: std::sync::Mutex<VecDeque<u8>>,
}

impl Shared {
    fn stderr_tail(&self) -> Option<String> {
        let ring = self.stderr_ring.lock().expect("stderr ring lock");
        if ring.is_empty() {
            return None;
        }
        let bytes = ring.iter().copied().collect::<Vec<u8>>();
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn transport_error(&self, message: &str) -> RpcError {
        RpcError::Transport {
            message: message.to_string(),
            stderr_tail: self.stderr_tail(),
        }
    }

    /// Completes every pending call with a transport failure. Entries
    /// inserted after this runs are caught by the caller's liveness
    /// double-check in `call`.
    fn fail_all_pending(&self, message: &str) {
        let slots = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect::<Vec<_>>()
        };
        if slots.is_empty() {
            return;
        }
        tracing::warn!(
            count = slots.len(),
            "completing pending calls with transport failure"
        );
        for (_, tx) in slots {
            let _ = tx.send(Err(self.transport_error(message)));
        }
    }

    fn reader_state(&self) -> ReaderState {
        *self.reader_state.lock().expect("reader state lock")
    }

    fn set_reader_state(&self, state: ReaderState) {
        *self.reader_state.lock().expect("reader state lock") = state;
    }
}

/// Owns one child process speaking newline-delimited JSON-RPC 2.0.
pub struct RpcTransport {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    shared: Arc<Shared>,
    next_id: AtomicI64,
    next_subscriber_id: AtomicU64,
    subscriber_capacity: usize,
    close_grace: Duration,
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("reader_state", &self.shared.reader_state())
            .finish()
    }
}

impl RpcTransport {
    pub fn spawn(spec: SpawnSpec) -> Result<Self, RpcError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        tracing::info!(program = ?spec.program, args = ?spec.args, "spawning agent process");

        let mut child = command.spawn().map_err(|error| RpcError::Spawn {
            command: spec.program.to_string_lossy().into_owned(),
            error,
        })?;

        let stdin = child.stdin.take().ok_or(RpcError::MissingStdin)?;
        let stdout = child.stdout.take().ok_or(RpcError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(RpcError::MissingStderr)?;

        let shared = Arc::new(Shared {
            pending: std::sync::Mutex::new(HashMap::new()),
            subscribers: std::sync::Mutex::new(Vec::new()),
            reader_state: std::sync::Mutex::new(ReaderState::Running),
            stderr_ring: std::sync::Mutex::new(VecDeque::with_capacity(STDERR_RING_BYTES)),
        });

        spawn_reader_loop(shared.clone(), stdout);
        spawn_stderr_loop(shared.clone(), stderr);

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            shared,
            next_id: AtomicI64::new(1),
            next_subscriber_id: AtomicU64::new(1),
            subscriber_capacity: spec.subscriber_capacity,
            close_grace: spec.close_grace,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.shared.reader_state() == ReaderState::Running
    }

    pub fn stderr_tail(&self) -> Option<String> {
        self.shared.stderr_tail()
    }

    /// Synchronous child liveness check, independent of the reader state.
    pub async fn child_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Sends a request and awaits the correlated response. Returns the
    /// `result` member on success, `RpcError::Rpc` for a JSON-RPC error
    /// object, and `RpcError::Transport` if the reader dies first.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if !self.is_alive() {
            return Err(self.shared.transport_error("reader not running"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending lock")
            .insert(id, tx);

        // The reader may have died between the liveness check and the
        // insert; re-checking after the insert guarantees the slot cannot
        // be stranded.
        if !self.is_alive() {
            if let Some(tx) = self.shared.pending.lock().expect("pending lock").remove(&id) {
                drop(tx);
                return Err(self.shared.transport_error("reader not running"));
            }
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, id, "rpc request");
        if let Err(err) = self.write_line(&payload).await {
            self.shared.pending.lock().expect("pending lock").remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.shared.transport_error("response slot dropped")),
        }
    }

    /// Fire-and-forget notification to the child (no id, no response).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        tracing::debug!(method, "rpc notification");
        self.write_line(&payload).await
    }

    /// Registers a notification subscriber for one conversation. Matching
    /// notifications are delivered in arrival order; the reader blocks when
    /// the queue is full, so subscribers must drain promptly and must drop
    /// the subscription when done.
    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscribers
            .lock()
            .expect("subscribers lock")
            .push(SubscriberEntry {
                id,
                conversation_id: conversation_id.to_string(),
                tx,
            });
        Subscription {
            id,
            shared: self.shared.clone(),
            rx,
        }
    }

    /// Closes stdin, waits up to the grace period for the child to exit,
    /// then kills it. All pending calls complete with a transport failure.
    pub async fn close(&self) {
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(self.close_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(code = status.code(), "agent process exited");
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "failed waiting for agent process");
                }
                Err(_) => {
                    tracing::warn!(
                        grace_ms = self.close_grace.as_millis() as u64,
                        "agent process did not exit in time, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }

        self.shared.fail_all_pending("transport closed");
    }

    async fn write_line(&self, payload: &Value) -> Result<(), RpcError> {
        let mut bytes = serde_json::to_vec(payload).map_err(RpcError::Serialize)?;
        bytes.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| RpcError::Write(
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"),
        ))?;
        stdin.write_all(&bytes).await.map_err(RpcError::Write)?;
        stdin.flush().await.map_err(RpcError::Write)?;
        Ok(())
    }
}

/// A live notification subscription. Dropping it unregisters the consumer,
/// which is what keeps a full queue from blocking the reader forever.
pub struct Subscription {
    id: u64,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Value>,
}

impl Subscription {
    /// Next matching notification, or `None` once the transport has closed
    /// the sending side (reader terminated).
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut subscribers = self.shared.subscribers.lock().expect("subscribers lock");
        subscribers.retain(|entry| entry.id != self.id);
    }
}

/// Conversation id carried by a notification envelope. The upstream schema
/// has used both `conversationId` and `threadId` across releases.
pub fn notification_conversation_id(value: &Value) -> Option<&str> {
    let params = value.get("params")?;
    params
        .get("conversationId")
        .or_else(|| params.get("threadId"))
        .and_then(Value::as_str)
}

fn spawn_reader_loop(shared: Arc<Shared>, stdout: tokio::process::ChildStdout) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let terminal_state;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    terminal_state = ReaderState::ClosedClean;
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "agent stdout read failed");
                    terminal_state = ReaderState::ClosedError;
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        raw = %truncate_for_log(trimmed),
                        "agent stdout: invalid JSON, skipping line"
                    );
                    continue;
                }
            };

            dispatch(&shared, value).await;
        }

        shared.set_reader_state(terminal_state);
        shared.fail_all_pending("agent process closed its stdout");
        // Dropping the senders ends every subscription stream.
        shared
            .subscribers
            .lock()
            .expect("subscribers lock")
            .clear();
        tracing::info!(state = ?terminal_state, "agent stdout: stream ended");
    });
}

async fn dispatch(shared: &Arc<Shared>, value: Value) {
    let has_result_or_error = value.get("result").is_some() || value.get("error").is_some();

    if let Some(id) = value.get("id").and_then(Value::as_i64) {
        if has_result_or_error {
            let slot = shared.pending.lock().expect("pending lock").remove(&id);
            match slot {
                Some(tx) => {
                    let outcome = if let Some(err) = value.get("error") {
                        Err(RpcError::Rpc {
                            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                            message: err
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown json-rpc error")
                                .to_string(),
                            data: err.get("data").cloned(),
                        })
                    } else {
                        Ok(value.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = tx.send(outcome);
                }
                None => {
                    tracing::warn!(id, "response has no matching pending request, dropping");
                }
            }
            return;
        }
    }

    if value.get("method").is_some() && value.get("id").is_none() {
        let targets = {
            let subscribers = shared.subscribers.lock().expect("subscribers lock");
            let conversation = notification_conversation_id(&value);
            subscribers
                .iter()
                .filter(|entry| conversation == Some(entry.conversation_id.as_str()))
                .map(|entry| entry.tx.clone())
                .collect::<Vec<_>>()
        };
        // Sequential awaits keep per-subscriber ordering identical to the
        // child's stdout order. A full queue blocks the reader by design.
        for tx in targets {
            let _ = tx.send(value.clone()).await;
        }
        return;
    }

    // A message with both `id` and `method` is a server-originated request;
    // the bridge never grants approvals interactively, so none are expected.
    tracing::warn!(
        method = value.get("method").and_then(serde_json::Value::as_str).unwrap_or("<none>"),
        "unexpected server-originated request, dropping"
    );
}

fn spawn_stderr_loop(shared: Arc<Shared>, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!("agent stderr: {line}");
            let mut ring = shared.stderr_ring.lock().expect("stderr ring lock");
            ring.extend(line.as_bytes().iter().copied());
            ring.push_back(b'\n');
            while ring.len() > STDERR_RING_BYTES {
                ring.pop_front();
            }
        }
    });
}

fn truncate_for_log(raw: &str) -> String {
    match raw.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}
