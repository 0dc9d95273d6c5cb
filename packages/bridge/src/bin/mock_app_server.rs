//! Stand-in for `codex app-server` used by the test suites: speaks the
//! same newline-delimited JSON-RPC dialect with an in-memory thread store.
//!
//! Prompt-keyed behaviors: a prompt containing `hang` starts a turn that
//! never completes; `fail` ends the turn with `turn/failed`. Env knobs:
//! `MOCK_PUNCTUATION=dot` switches turn notifications to the dotted
//! generation, `MOCK_DELTA_DELAY_MS` paces the notification stream.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

struct MockThread {
    preview: Option<String>,
    created_at: f64,
    updated_at: f64,
    turns: Vec<Value>,
}

struct MockServer {
    threads: HashMap<String, MockThread>,
    thread_order: Vec<String>,
    next_thread: u64,
    turn_separator: char,
    delta_delay: Duration,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--version") {
        println!("codex-cli 0.0.0-mock");
        return;
    }

    let turn_separator = match std::env::var("MOCK_PUNCTUATION").as_deref() {
        Ok("dot") => '.',
        _ => '/',
    };
    let delta_delay = std::env::var("MOCK_DELTA_DELAY_MS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO);

    let mut server = MockServer {
        threads: HashMap::new(),
        thread_order: Vec::new(),
        next_thread: 0,
        turn_separator,
        delta_delay,
    };

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        server.handle(message);
    }
}

impl MockServer {
    fn handle(&mut self, message: Value) {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return;
        };
        let method = method.to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let Some(id) = message.get("id").cloned() else {
            // Client notifications (`initialized`) need no reply.
            return;
        };

        match method.as_str() {
            "initialize" => {
                respond(&id, json!({"serverInfo": {"name": "mock-app-server"}}));
            }
            "loginApiKey" => {
                respond(&id, json!({}));
            }
            "newConversation" => {
                self.next_thread += 1;
                let thread_id = format!("mock-thread-{}", self.next_thread);
                let now = epoch_now();
                self.threads.insert(
                    thread_id.clone(),
                    MockThread {
                        preview: None,
                        created_at: now,
                        updated_at: now,
                        turns: Vec::new(),
                    },
                );
                self.thread_order.push(thread_id.clone());
                respond(&id, json!({"conversationId": thread_id}));
            }
            "sendUserTurn" => self.handle_turn(&id, &params),
            "listConversations" => self.handle_list(&id, &params),
            "getConversation" => self.handle_get(&id, &params),
            other => {
                respond_error(&id, -32601, &format!("method not found: {other}"));
            }
        }
    }

    fn handle_turn(&mut self, id: &Value, params: &Value) {
        let conversation_id = params
            .get("conversationId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let prompt = params
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !self.threads.contains_key(&conversation_id) {
            respond_error(
                id,
                -32602,
                &format!("conversation not found: {conversation_id}"),
            );
            return;
        }

        respond(id, json!({}));

        let sep = self.turn_separator;
        self.emit_turn_event("started", sep, &conversation_id);

        if prompt.contains("hang") {
            return;
        }

        if prompt.contains("fail") {
            self.pace();
            notify(
                &format!("turn{sep}failed"),
                json!({
                    "conversationId": conversation_id,
                    "error": {"message": "mock turn failure"},
                }),
            );
            return;
        }

        let reply = format!("mock: {prompt}");
        self.pace();
        notify(
            "item/started",
            json!({
                "conversationId": conversation_id,
                "item": {"type": "agentMessage"},
            }),
        );
        let split = reply.len() / 2;
        let split = (0..=split)
            .rev()
            .find(|at| reply.is_char_boundary(*at))
            .unwrap_or(0);
        for chunk in [&reply[..split], &reply[split..]] {
            self.pace();
            notify(
                "item/agentMessage/delta",
                json!({"conversationId": conversation_id, "delta": chunk}),
            );
        }
        self.pace();
        notify(
            "item/completed",
            json!({
                "conversationId": conversation_id,
                "item": {"type": "agentMessage", "text": reply},
            }),
        );
        self.pace();
        self.emit_turn_event("completed", sep, &conversation_id);

        let thread = self.threads.get_mut(&conversation_id).expect("checked");
        thread.turns.push(json!({
            "items": [
                {"type": "userMessage", "text": prompt},
                {"type": "agentMessage", "text": reply},
            ]
        }));
        if thread.preview.is_none() {
            thread.preview = Some(reply);
        }
        thread.updated_at = epoch_now();
    }

    fn handle_list(&self, id: &Value, params: &Value) {
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(50) as usize;
        let data = self
            .thread_order
            .iter()
            .take(limit)
            .filter_map(|thread_id| {
                self.threads.get(thread_id).map(|thread| {
                    json!({
                        "id": thread_id,
                        "preview": thread.preview,
                        "createdAt": thread.created_at,
                        "updatedAt": thread.updated_at,
                    })
                })
            })
            .collect::<Vec<_>>();
        respond(id, json!({"data": data, "nextCursor": null}));
    }

    fn handle_get(&self, id: &Value, params: &Value) {
        let conversation_id = params
            .get("conversationId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match self.threads.get(conversation_id) {
            Some(thread) => {
                respond(
                    id,
                    json!({
                        "thread": {
                            "id": conversation_id,
                            "preview": thread.preview,
                            "createdAt": thread.created_at,
                            "turns": thread.turns,
                        }
                    }),
                );
            }
            None => {
                respond_error(
                    id,
                    -32602,
                    &format!("thread not found: {conversation_id}"),
                );
            }
        }
    }

    fn emit_turn_event(&self, phase: &str, sep: char, conversation_id: &str) {
        notify(
            &format!("turn{sep}{phase}"),
            json!({"conversationId": conversation_id}),
        );
    }

    fn pace(&self) {
        if !self.delta_delay.is_zero() {
            std::thread::sleep(self.delta_delay);
        }
    }
}

fn respond(id: &Value, result: Value) {
    write_line(json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn respond_error(id: &Value, code: i64, message: &str) {
    write_line(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }));
}

fn notify(method: &str, params: Value) {
    write_line(json!({"jsonrpc": "2.0", "method": method, "params": params}));
}

fn write_line(value: Value) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
