use chrono::{DateTime, Utc};
use codex_bridge_error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::session::{conversation_items, Session};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 200;
const PREVIEW_MAX_CHARS: usize = 80;

/// Thread summary for the list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ThreadInfo {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ThreadsResponse {
    pub threads: Vec<ThreadInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ThreadHistoryResponse {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[schema(value_type = Vec<Object>)]
    pub turns: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

pub async fn list_threads(
    session: &Session,
    limit: usize,
    cursor: Option<&str>,
) -> Result<ThreadsResponse, BridgeError> {
    let limit = limit.clamp(1, MAX_LIMIT);
    let result = session.list_conversations(limit, cursor).await?;

    let threads = conversation_items(&result)
        .iter()
        .map(|item| ThreadInfo {
            thread_id: item
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            preview: item
                .get("preview")
                .and_then(Value::as_str)
                .map(|p| truncate_chars(p, PREVIEW_MAX_CHARS)),
            created_at: item.get("createdAt").and_then(epoch_to_datetime),
            updated_at: item.get("updatedAt").and_then(epoch_to_datetime),
        })
        .collect();

    Ok(ThreadsResponse {
        threads,
        next_cursor: cursor_string(result.get("nextCursor")),
    })
}

pub async fn thread_history(
    session: &Session,
    thread_id: &str,
) -> Result<ThreadHistoryResponse, BridgeError> {
    let result = session.get_conversation(thread_id).await?;
    // thread/read-era servers wrap the thread; newer ones return it flat.
    let thread = result.get("thread").unwrap_or(&result);

    let turns = thread
        .get("turns")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let preview = thread
        .get("preview")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| derive_preview(&turns))
        .map(|p| truncate_chars(&p, PREVIEW_MAX_CHARS));

    Ok(ThreadHistoryResponse {
        thread_id: thread
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(thread_id)
            .to_string(),
        preview,
        turns,
        created_at: thread.get("createdAt").and_then(epoch_to_datetime),
    })
}

/// First agent message of the oldest turn.
fn derive_preview(turns: &[Value]) -> Option<String> {
    let oldest = turns.first()?;
    let items = oldest.get("items").and_then(Value::as_array)?;
    items.iter().find_map(|item| {
        if item.get("type").and_then(Value::as_str) == Some("agentMessage") {
            item.get("text")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        } else {
            None
        }
    })
}

fn truncate_chars(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        raw.to_string()
    } else {
        raw.chars().take(max).collect()
    }
}

fn epoch_to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = value.as_f64()?;
    let secs = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn cursor_string(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derive_preview_uses_oldest_turn_agent_message() {
        let turns = vec![
            json!({"items": [
                {"type": "userMessage", "text": "hi"},
                {"type": "agentMessage", "text": "first reply"}
            ]}),
            json!({"items": [{"type": "agentMessage", "text": "second reply"}]}),
        ];
        assert_eq!(derive_preview(&turns).as_deref(), Some("first reply"));
    }

    #[test]
    fn derive_preview_handles_missing_items() {
        assert_eq!(derive_preview(&[]), None);
        assert_eq!(derive_preview(&[json!({"items": []})]), None);
    }

    #[test]
    fn truncation_is_char_aware() {
        let long = "x".repeat(200);
        assert_eq!(truncate_chars(&long, 80).len(), 80);
        assert_eq!(truncate_chars("short", 80), "short");
    }

    #[test]
    fn epoch_conversion_accepts_floats() {
        let dt = epoch_to_datetime(&json!(1_700_000_000.5)).expect("datetime");
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert!(epoch_to_datetime(&json!("nope")).is_none());
    }

    #[test]
    fn cursor_normalizes_numbers_to_strings() {
        assert_eq!(cursor_string(Some(&json!("abc"))).as_deref(), Some("abc"));
        assert_eq!(cursor_string(Some(&json!(42))).as_deref(), Some("42"));
        assert_eq!(cursor_string(Some(&json!(null))), None);
        assert_eq!(cursor_string(None), None);
    }
}
