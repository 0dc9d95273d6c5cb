//! Translation of one chat turn into an SSE stream or an aggregated
//! response. Both modes consume the same turn-handle subscription; the
//! aggregated path is just a stream consumer that buffers until the
//! terminal notification.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use codex_bridge_error::BridgeError;
use futures::{stream, Stream};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::manager::LeasedSession;
use crate::protocol;
use crate::session::TurnHandle;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Everything a non-streaming `/chat` needs for its response envelope.
#[derive(Debug)]
pub struct AggregatedTurn {
    pub thread_id: String,
    pub message: String,
    pub events: Vec<Value>,
}

/// Drains the turn handle to its terminal notification. `message` is the
/// concatenation of `agentMessage` item-completion texts. A `turn/failed`
/// terminal or a mid-turn transport close surfaces as an upstream error; a
/// blown wall clock marks the session for a health probe and maps to 504.
pub async fn aggregate_turn(
    lease: &LeasedSession,
    mut handle: TurnHandle,
    turn_timeout: Duration,
) -> Result<AggregatedTurn, BridgeError> {
    let deadline = Instant::now() + turn_timeout;
    let mut events = Vec::new();
    let mut message = String::new();

    loop {
        match tokio::time::timeout_at(deadline, handle.next_event()).await {
            Ok(Some(event)) => {
                if let Some(text) = protocol::agent_message_completion_text(&event) {
                    message.push_str(text);
                }
                let method = protocol::notification_method(&event).unwrap_or_default();
                if protocol::is_turn_failed(method) {
                    return Err(BridgeError::upstream(protocol::turn_failure_reason(&event)));
                }
                let done = protocol::is_turn_completed(method);
                events.push(event);
                if done {
                    break;
                }
            }
            Ok(None) => {
                return Err(BridgeError::Upstream {
                    message: "agent closed the stream mid-turn".to_string(),
                    stderr_tail: lease.session().stderr_tail(),
                });
            }
            Err(_) => {
                lease.session().request_health_probe();
                return Err(BridgeError::TurnTimeout {
                    seconds: turn_timeout.as_secs(),
                });
            }
        }
    }

    Ok(AggregatedTurn {
        thread_id: handle.conversation_id().to_string(),
        message,
        events,
    })
}

enum StreamPhase {
    /// The synthesized session frame goes out before any model output.
    SessionFrame,
    Events,
    /// Terminal (or error) frame already sent; `[DONE]` is next.
    Done,
    Finished,
}

struct SseTurnState {
    // Held so the lease outlives the response body; dropping the state on
    // client disconnect releases both the subscription and the turn lock.
    lease: LeasedSession,
    handle: TurnHandle,
    deadline: Instant,
    phase: StreamPhase,
}

/// SSE frames for one turn: `{"type":"session",...}` first, upstream
/// notifications verbatim, `[DONE]` last. Frames after the terminal
/// notification never appear; the upstream turn keeps running if the
/// client goes away.
pub fn sse_turn_stream(
    lease: LeasedSession,
    handle: TurnHandle,
    turn_timeout: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let state = SseTurnState {
        lease,
        handle,
        deadline: Instant::now() + turn_timeout,
        phase: StreamPhase::SessionFrame,
    };

    stream::unfold(state, |mut state| async move {
        match state.phase {
            StreamPhase::SessionFrame => {
                state.phase = StreamPhase::Events;
                let frame = json!({
                    "type": "session",
                    "thread_id": state.handle.conversation_id(),
                });
                Some((Ok(Event::default().data(frame.to_string())), state))
            }
            StreamPhase::Events => {
                match tokio::time::timeout_at(state.deadline, state.handle.next_event()).await {
                    Ok(Some(event)) => {
                        if state.handle.terminal_seen() {
                            state.phase = StreamPhase::Done;
                        }
                        Some((Ok(Event::default().data(event.to_string())), state))
                    }
                    Ok(None) => {
                        state.phase = StreamPhase::Done;
                        let frame = error_frame(
                            state.handle.conversation_id(),
                            "agent closed the stream mid-turn",
                        );
                        Some((Ok(Event::default().data(frame.to_string())), state))
                    }
                    Err(_) => {
                        state.lease.session().request_health_probe();
                        state.phase = StreamPhase::Done;
                        let frame =
                            error_frame(state.handle.conversation_id(), "turn timed out");
                        Some((Ok(Event::default().data(frame.to_string())), state))
                    }
                }
            }
            StreamPhase::Done => {
                state.phase = StreamPhase::Finished;
                Some((Ok(Event::default().data(DONE_SENTINEL)), state))
            }
            StreamPhase::Finished => None,
        }
    })
}

fn error_frame(thread_id: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "thread_id": thread_id,
        "message": message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frame_shape() {
        let frame = error_frame("t1", "boom");
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["thread_id"], "t1");
        assert_eq!(frame["message"], "boom");
    }
}
