use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codex_bridge_error::BridgeError;
use codex_bridge_rpc::{RpcError, RpcTransport, SpawnSpec, Subscription};
use serde_json::{json, Value};

use crate::config::Config;
use crate::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Draining,
    Dead,
}

/// One user's codex app-server instance: the child process (via its
/// transport), the set of conversations created under it, and the turn
/// lock that serializes prompts.
pub struct Session {
    user_id: String,
    data_dir: PathBuf,
    transport: RpcTransport,
    conversation_ids: std::sync::Mutex<HashSet<String>>,
    state: std::sync::Mutex<SessionState>,
    last_active: std::sync::Mutex<Instant>,
    turn_lock: Arc<tokio::sync::Mutex<()>>,
    health_probe_requested: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Creates the user's data directory, spawns `codex app-server` with
    /// `CODEX_HOME` pointed at it, and runs the protocol handshake. Any
    /// failure tears the child down and surfaces as an upstream error.
    pub async fn start(user_id: &str, config: &Config) -> Result<Arc<Self>, BridgeError> {
        let data_dir = config.user_data_dir(user_id);
        std::fs::create_dir_all(&data_dir).map_err(|err| {
            BridgeError::internal(format!(
                "Failed to create user directory {}: {err}",
                data_dir.display()
            ))
        })?;

        let binary = config.resolve_codex_binary()?;
        let mut spec = SpawnSpec::new(&binary)
            .arg("app-server")
            .env("CODEX_HOME", data_dir.to_string_lossy());
        if let Some(key) = &config.openai_api_key {
            spec = spec.env("OPENAI_API_KEY", key);
        }
        if let Some(cwd) = &config.codex_working_dir {
            spec = spec.cwd(cwd);
        }

        tracing::info!(user_id, data_dir = %data_dir.display(), "starting session");
        let transport = RpcTransport::spawn(spec).map_err(map_rpc_error)?;

        let session = Arc::new(Self {
            user_id: user_id.to_string(),
            data_dir,
            transport,
            conversation_ids: std::sync::Mutex::new(HashSet::new()),
            state: std::sync::Mutex::new(SessionState::Starting),
            last_active: std::sync::Mutex::new(Instant::now()),
            turn_lock: Arc::new(tokio::sync::Mutex::new(())),
            health_probe_requested: AtomicBool::new(false),
        });

        if let Err(err) = session.handshake(config).await {
            session.set_state(SessionState::Dead);
            session.transport.close().await;
            return Err(err);
        }

        session.set_state(SessionState::Ready);
        tracing::info!(user_id, "session ready");
        Ok(session)
    }

    async fn handshake(&self, config: &Config) -> Result<(), BridgeError> {
        self.transport
            .call(
                protocol::INITIALIZE,
                json!({
                    "clientInfo": {
                        "name": "codex-bridge",
                        "title": "Codex Bridge",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await
            .map_err(map_rpc_error)?;

        self.transport
            .notify(protocol::INITIALIZED, json!({}))
            .await
            .map_err(map_rpc_error)?;

        if let Some(key) = &config.openai_api_key {
            self.transport
                .call(protocol::LOGIN_API_KEY, json!({"apiKey": key}))
                .await
                .map_err(map_rpc_error)?;
            tracing::debug!(user_id = %self.user_id, "authenticated with api key");
        }

        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("state lock") = next;
    }

    pub fn mark_draining(&self) {
        let mut state = self.state.lock().expect("state lock");
        if *state == SessionState::Ready {
            *state = SessionState::Draining;
        }
    }

    pub fn mark_dead(&self) {
        self.set_state(SessionState::Dead);
    }

    pub fn is_usable(&self) -> bool {
        self.state() == SessionState::Ready && self.transport.is_alive()
    }

    pub fn touch(&self) {
        *self.last_active.lock().expect("last_active lock") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().expect("last_active lock").elapsed()
    }

    /// Set after a turn timeout; a slow turn is not a sick session, so the
    /// next acquire probes child liveness instead of killing it here.
    pub fn request_health_probe(&self) {
        self.health_probe_requested.store(true, Ordering::SeqCst);
    }

    pub fn take_health_probe_request(&self) -> bool {
        self.health_probe_requested.swap(false, Ordering::SeqCst)
    }

    pub async fn child_running(&self) -> bool {
        self.transport.child_running().await
    }

    pub fn stderr_tail(&self) -> Option<String> {
        self.transport.stderr_tail()
    }

    /// Closes the child and moves the session to its final state.
    pub async fn close(&self) {
        self.set_state(SessionState::Dead);
        self.transport.close().await;
    }

    /// Starts one turn. Fails fast with a busy error when another turn is
    /// in flight; resolves/creates the conversation; subscribes to its
    /// notifications *before* issuing `sendUserTurn` so none are missed.
    pub async fn send_turn(
        &self,
        conversation_id: Option<String>,
        text: &str,
        model: Option<&str>,
    ) -> Result<TurnHandle, BridgeError> {
        let turn_guard = self
            .turn_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| BridgeError::SessionBusy {
                user_id: self.user_id.clone(),
            })?;

        let conversation_id = match conversation_id {
            Some(id) => {
                self.ensure_known_conversation(&id).await?;
                id
            }
            None => self.new_conversation(model).await?,
        };

        let subscription = self.transport.subscribe(&conversation_id);

        let mut params = json!({
            "conversationId": conversation_id,
            "items": [{"type": "text", "text": text}],
        });
        if let Some(model) = model {
            params["model"] = Value::String(model.to_string());
        }

        self.transport
            .call(protocol::SEND_USER_TURN, params)
            .await
            .map_err(map_rpc_error)?;
        self.touch();

        Ok(TurnHandle {
            conversation_id,
            subscription,
            _turn: turn_guard,
            terminal_seen: false,
        })
    }

    async fn new_conversation(&self, model: Option<&str>) -> Result<String, BridgeError> {
        let mut params = json!({"approvalPolicy": "never"});
        if let Some(model) = model {
            params["model"] = Value::String(model.to_string());
        }

        let result = self
            .transport
            .call(protocol::NEW_CONVERSATION, params)
            .await
            .map_err(map_rpc_error)?;

        let id = conversation_id_from_result(&result).ok_or_else(|| {
            BridgeError::upstream("newConversation response missing conversation id")
        })?;

        self.conversation_ids
            .lock()
            .expect("conversation_ids lock")
            .insert(id.clone());
        self.touch();
        tracing::info!(user_id = %self.user_id, conversation_id = %id, "created conversation");
        Ok(id)
    }

    /// A client-supplied thread id is accepted iff this session created it
    /// or the upstream listing confirms it. Unknown ids fail before any
    /// write is issued.
    async fn ensure_known_conversation(&self, conversation_id: &str) -> Result<(), BridgeError> {
        if self
            .conversation_ids
            .lock()
            .expect("conversation_ids lock")
            .contains(conversation_id)
        {
            return Ok(());
        }

        let result = self
            .transport
            .call(
                protocol::LIST_CONVERSATIONS,
                json!({"limit": 200, "sortKey": "created_at"}),
            )
            .await
            .map_err(map_rpc_error)?;

        let known = conversation_items(&result)
            .iter()
            .filter_map(|item| item.get("id").and_then(Value::as_str))
            .any(|id| id == conversation_id);

        if !known {
            return Err(BridgeError::ThreadNotFound {
                thread_id: conversation_id.to_string(),
            });
        }

        self.conversation_ids
            .lock()
            .expect("conversation_ids lock")
            .insert(conversation_id.to_string());
        Ok(())
    }

    pub async fn list_conversations(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let mut params = json!({"limit": limit, "sortKey": "created_at"});
        if let Some(cursor) = cursor {
            params["cursor"] = Value::String(cursor.to_string());
        }
        let result = self
            .transport
            .call(protocol::LIST_CONVERSATIONS, params)
            .await
            .map_err(map_rpc_error)?;
        self.touch();
        Ok(result)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Value, BridgeError> {
        let result = self
            .transport
            .call(
                protocol::GET_CONVERSATION,
                json!({"conversationId": conversation_id, "includeTurns": true}),
            )
            .await
            .map_err(|err| map_thread_error(err, conversation_id))?;
        self.touch();
        Ok(result)
    }
}

/// The scope of one `sendUserTurn`: a notification subscription plus the
/// owned turn-lock guard. Dropping the handle unsubscribes and releases
/// the lock, whether the turn finished or the client went away.
pub struct TurnHandle {
    conversation_id: String,
    subscription: Subscription,
    _turn: tokio::sync::OwnedMutexGuard<()>,
    terminal_seen: bool,
}

impl std::fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle")
            .field("conversation_id", &self.conversation_id)
            .field("terminal_seen", &self.terminal_seen)
            .finish()
    }
}

impl TurnHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next notification for this conversation, in arrival order. Returns
    /// `None` after the terminal notification has been yielded, or
    /// immediately if the transport closed mid-turn (the caller
    /// distinguishes the two via `terminal_seen`).
    pub async fn next_event(&mut self) -> Option<Value> {
        if self.terminal_seen {
            return None;
        }
        let value = self.subscription.recv().await?;
        if let Some(method) = protocol::notification_method(&value) {
            if protocol::is_terminal(method) {
                self.terminal_seen = true;
            }
        }
        Some(value)
    }

    pub fn terminal_seen(&self) -> bool {
        self.terminal_seen
    }
}

fn conversation_id_from_result(result: &Value) -> Option<String> {
    result
        .get("conversationId")
        .and_then(Value::as_str)
        .or_else(|| result.get("threadId").and_then(Value::as_str))
        .or_else(|| {
            result
                .get("thread")
                .and_then(|t| t.get("id"))
                .and_then(Value::as_str)
        })
        .map(ToOwned::to_owned)
}

/// Items of a `listConversations` result; the schema has shipped both
/// `data` and `items` as the array key.
pub fn conversation_items(result: &Value) -> Vec<Value> {
    result
        .get("data")
        .or_else(|| result.get("items"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub fn map_rpc_error(err: RpcError) -> BridgeError {
    match err {
        RpcError::Rpc { message, code, .. } => {
            BridgeError::upstream(format!("agent rejected request ({code}): {message}"))
        }
        RpcError::Transport {
            message,
            stderr_tail,
        } => BridgeError::Upstream {
            message: format!("agent transport failed: {message}"),
            stderr_tail,
        },
        other => BridgeError::upstream(other.to_string()),
    }
}

fn map_thread_error(err: RpcError, conversation_id: &str) -> BridgeError {
    if let RpcError::Rpc { message, .. } = &err {
        if message.to_lowercase().contains("not found") {
            return BridgeError::ThreadNotFound {
                thread_id: conversation_id.to_string(),
            };
        }
    }
    map_rpc_error(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_accepts_schema_variants() {
        assert_eq!(
            conversation_id_from_result(&json!({"conversationId": "a"})).as_deref(),
            Some("a")
        );
        assert_eq!(
            conversation_id_from_result(&json!({"threadId": "b"})).as_deref(),
            Some("b")
        );
        assert_eq!(
            conversation_id_from_result(&json!({"thread": {"id": "c"}})).as_deref(),
            Some("c")
        );
        assert_eq!(conversation_id_from_result(&json!({})), None);
    }

    #[test]
    fn conversation_items_accepts_both_array_keys() {
        let data = json!({"data": [{"id": "x"}]});
        assert_eq!(conversation_items(&data).len(), 1);
        let items = json!({"items": [{"id": "x"}, {"id": "y"}]});
        assert_eq!(conversation_items(&items).len(), 2);
        assert!(conversation_items(&json!({})).is_empty());
    }
}
