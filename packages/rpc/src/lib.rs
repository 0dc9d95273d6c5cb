//! JSON-RPC 2.0 transport over a child process's stdio.
//!
//! One `RpcTransport` owns one subprocess: a single reader task correlates
//! responses to pending requests by id and fans server-initiated
//! notifications out to per-conversation subscribers; a writer mutex keeps
//! line framing atomic; a stderr drain keeps the last few KiB for
//! diagnostics when the transport dies.

mod transport;

pub use transport::{
    notification_conversation_id, ReaderState, RpcError, RpcTransport, SpawnSpec, Subscription,
};
