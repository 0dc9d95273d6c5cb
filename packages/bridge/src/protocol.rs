//! Method names and notification shapes of the codex app-server protocol.
//!
//! The app-server has shipped two punctuation generations for turn/item
//! notifications (`turn.completed` vs `turn/completed`); classification
//! accepts both so either child works.

use serde_json::Value;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const LOGIN_API_KEY: &str = "loginApiKey";
pub const NEW_CONVERSATION: &str = "newConversation";
pub const SEND_USER_TURN: &str = "sendUserTurn";
pub const LIST_CONVERSATIONS: &str = "listConversations";
pub const GET_CONVERSATION: &str = "getConversation";

pub fn notification_method(value: &Value) -> Option<&str> {
    value.get("method").and_then(Value::as_str)
}

pub fn is_turn_completed(method: &str) -> bool {
    matches!(method, "turn/completed" | "turn.completed")
}

pub fn is_turn_failed(method: &str) -> bool {
    matches!(method, "turn/failed" | "turn.failed")
}

pub fn is_terminal(method: &str) -> bool {
    is_turn_completed(method) || is_turn_failed(method)
}

pub fn is_item_completed(method: &str) -> bool {
    matches!(method, "item/completed" | "item.completed")
}

/// Text of a completed `agentMessage` item, if this notification is one.
pub fn agent_message_completion_text(value: &Value) -> Option<&str> {
    let method = notification_method(value)?;
    if !is_item_completed(method) {
        return None;
    }
    let item = value.get("params")?.get("item")?;
    if item.get("type").and_then(Value::as_str) != Some("agentMessage") {
        return None;
    }
    item.get("text").and_then(Value::as_str)
}

/// Human-readable reason from a `turn/failed` notification.
pub fn turn_failure_reason(value: &Value) -> String {
    let params = value.get("params");
    params
        .and_then(|p| p.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| params.and_then(|p| p.get("reason")).and_then(Value::as_str))
        .or_else(|| params.and_then(|p| p.get("message")).and_then(Value::as_str))
        .unwrap_or("turn failed")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn both_punctuation_generations_classify() {
        assert!(is_turn_completed("turn/completed"));
        assert!(is_turn_completed("turn.completed"));
        assert!(is_turn_failed("turn/failed"));
        assert!(is_turn_failed("turn.failed"));
        assert!(is_terminal("turn.completed"));
        assert!(!is_terminal("turn.started"));
        assert!(!is_terminal("item/completed"));
    }

    #[test]
    fn agent_message_completion_extracts_text() {
        let event = json!({
            "jsonrpc": "2.0",
            "method": "item/completed",
            "params": {
                "conversationId": "t1",
                "item": {"type": "agentMessage", "text": "hello"}
            }
        });
        assert_eq!(agent_message_completion_text(&event), Some("hello"));

        let tool_item = json!({
            "method": "item/completed",
            "params": {"item": {"type": "commandExecution", "text": "ls"}}
        });
        assert_eq!(agent_message_completion_text(&tool_item), None);

        let delta = json!({
            "method": "item/agentMessage/delta",
            "params": {"delta": "he"}
        });
        assert_eq!(agent_message_completion_text(&delta), None);
    }

    #[test]
    fn failure_reason_prefers_error_message() {
        let event = json!({
            "method": "turn/failed",
            "params": {"error": {"message": "model overloaded"}}
        });
        assert_eq!(turn_failure_reason(&event), "model overloaded");

        let bare = json!({"method": "turn/failed", "params": {}});
        assert_eq!(turn_failure_reason(&bare), "turn failed");
    }
}
