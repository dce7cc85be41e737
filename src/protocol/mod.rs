//! Wire envelope types for the document-store RPC protocol.
//!
//! Requests are `{method, params, id}` objects; responses carry an optional
//! correlation `id`, a `result`, an `error` envelope, or a `chunk` descriptor
//! for sliced large results. Control frames (`hello`, `ping`, `#upgrading`)
//! use the reserved id `-1`.
//!
//! These are shapes only; encoding happens in [`crate::codec`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request/response correlation id.
///
/// Monotonically increasing, unique for the lifetime of one connection
/// facade. `-1` is reserved for control frames.
pub type ReqId = i64;

/// Reserved id for control frames.
pub const CONTROL_ID: ReqId = -1;

/// Handshake control method.
pub const HELLO_METHOD: &str = "hello";

/// Keepalive method.
pub const PING_METHOD: &str = "ping";

/// Fire-and-forget ack for a server-driven model upgrade.
pub const UPGRADING_METHOD: &str = "#upgrading";

/// Error code the server uses to refuse a handshake.
pub const UNAUTHORIZED_CODE: &str = "UNAUTHORIZED";

/// Well-known transaction classes the transport has to recognize.
pub mod classes {
    /// Base transaction class, used by replay predicates to probe whether a
    /// write already landed.
    pub const TX: &str = "core:class:Tx";
    /// Conditional/batch-apply transaction.
    pub const TX_APPLY_IF: &str = "core:class:TxApplyIf";
    /// Server-driven model upgrade marker.
    pub const TX_MODEL_UPGRADE: &str = "core:class:TxModelUpgrade";
    /// Workspace event carrier; see [`super::WORKSPACE_EVENT_UPGRADE`].
    pub const TX_WORKSPACE_EVENT: &str = "core:class:TxWorkspaceEvent";
}

/// `event` code of a `TxWorkspaceEvent` announcing a model upgrade.
pub const WORKSPACE_EVENT_UPGRADE: i64 = 1;

/// An outbound remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Remote method name.
    pub method: String,
    /// Ordered parameter list.
    pub params: Vec<Value>,
    /// Correlation id, `-1` for control frames.
    pub id: ReqId,
}

impl Request {
    /// Build a control frame (`id = -1`).
    pub fn control(method: &str) -> Self {
        Self {
            method: method.to_string(),
            params: Vec::new(),
            id: CONTROL_ID,
        }
    }
}

/// The `hello` handshake frame sent right after the raw socket opens.
///
/// Announces the desired binary/compression mode and subscribes to
/// broadcasts. Always serialized in text mode; the ack decides the mode for
/// the rest of the session.
#[derive(Debug, Clone, Serialize)]
pub struct HelloRequest {
    pub method: &'static str,
    pub params: Vec<Value>,
    pub id: ReqId,
    pub binary: bool,
    pub compression: bool,
    pub broadcast: bool,
}

impl HelloRequest {
    pub fn new(binary: bool, compression: bool) -> Self {
        Self {
            method: HELLO_METHOD,
            params: Vec::new(),
            id: CONTROL_ID,
            binary,
            compression,
            broadcast: true,
        }
    }
}

/// Payload of the `hello` ack (`result` of the response with id `-1`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelloAck {
    /// Server will use the binary envelope for the rest of the session.
    #[serde(default)]
    pub binary: bool,
    /// This session id was seen before; the server restored session state.
    #[serde(default)]
    pub reconnect: bool,
    /// The session id is still attached to a live server-side connection.
    #[serde(default, rename = "alreadyConnected")]
    pub already_connected: bool,
}

/// Descriptor of one slice of a chunked large result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Position of this slice in the reassembled result.
    pub index: u32,
    /// Total number of slices the server intends to send.
    pub total: u32,
    /// Set on the last *delivered* slice; arrival order is free.
    #[serde(rename = "final")]
    pub last: bool,
}

/// Structured error envelope attached to a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Machine-readable error code.
    pub code: String,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RpcError {
    pub fn is_unauthorized(&self) -> bool {
        self.code == UNAUTHORIZED_CODE
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

/// An inbound envelope: a correlated reply, a control ack, or (without an
/// id) a broadcast batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id; absent on broadcast batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ReqId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

impl Response {
    /// True for the server's keepalive prompt (`result == "ping"`), which is
    /// answered with an ordinary `ping` call.
    pub fn is_ping_prompt(&self) -> bool {
        matches!(&self.result, Some(Value::String(s)) if s == PING_METHOD)
    }

    /// Parse the `hello` ack payload out of this response.
    pub fn hello_ack(&self) -> HelloAck {
        self.result
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// Flatten a broadcast `result` into the transaction batch it carries.
///
/// Servers send either a single transaction object or an array of them; the
/// handler always receives the batch in server order.
pub fn broadcast_batch(result: Option<Value>) -> Vec<Value> {
    match result {
        Some(Value::Array(txes)) => txes,
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

/// True if this broadcast transaction announces a server-side model upgrade.
pub fn is_upgrade_event(tx: &Value) -> bool {
    match tx.get("_class").and_then(Value::as_str) {
        Some(classes::TX_MODEL_UPGRADE) => true,
        Some(classes::TX_WORKSPACE_EVENT) => {
            tx.get("event").and_then(Value::as_i64) == Some(WORKSPACE_EVENT_UPGRADE)
        }
        _ => false,
    }
}
