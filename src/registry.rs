//! Pending call registry.
//!
//! Tracks every in-flight remote call by id: its resolution handle, its
//! replay policy for reconnects, and the chunk buffer for sliced large
//! results. Entries leave the registry only on final resolution or
//! rejection - a replayed call keeps its id.
//!
//! The registry itself is synchronous; the lifecycle manager drives it from
//! the single inbound dispatch path and never holds the lock across an
//! await.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{ReqId, RpcError};

/// Boxed future used by replay predicates and post-processors.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Async idempotency predicate: `true` means "no evidence the effect
/// landed, resend".
pub type RetryPredicate = Arc<dyn Fn() -> BoxFuture<bool> + Send + Sync>;

/// Async result post-processor; runs before the caller sees the result.
pub type PostProcess = Arc<dyn Fn(Value) -> BoxFuture<()> + Send + Sync>;

/// Final outcome delivered to the caller.
pub type CallResult = std::result::Result<Value, RpcError>;

/// What the lifecycle manager does with a pending call on reconnect.
#[derive(Clone)]
pub enum ReplayPolicy {
    /// Resend unconditionally. Safe for idempotent reads.
    Idempotent,
    /// Resend only if the predicate confirms the effect has not landed.
    ConditionalRetry(RetryPredicate),
    /// Leave pending; something else decides.
    NoRetry,
}

impl fmt::Debug for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayPolicy::Idempotent => f.write_str("Idempotent"),
            ReplayPolicy::ConditionalRetry(_) => f.write_str("ConditionalRetry"),
            ReplayPolicy::NoRetry => f.write_str("NoRetry"),
        }
    }
}

/// One in-flight remote call.
pub struct PendingCall {
    pub method: String,
    pub params: Vec<Value>,
    pub replay: ReplayPolicy,
    post_process: Option<PostProcess>,
    resolver: oneshot::Sender<CallResult>,
    chunks: Vec<(u32, Value)>,
    sent: bool,
}

impl PendingCall {
    /// Resolve or reject the call, running the post-processor first on
    /// success. The post-processor may be async, so that path is spawned.
    pub fn complete(self, outcome: CallResult) {
        match (outcome, self.post_process) {
            (Ok(result), Some(post)) => {
                let resolver = self.resolver;
                tokio::spawn(async move {
                    post(result.clone()).await;
                    let _ = resolver.send(Ok(result));
                });
            }
            (outcome, _) => {
                let _ = self.resolver.send(outcome);
            }
        }
    }
}

/// Owned snapshot of a pending call, handed to reconnect replay.
#[derive(Clone)]
pub struct ReplayEntry {
    pub id: ReqId,
    pub method: String,
    pub params: Vec<Value>,
    pub replay: ReplayPolicy,
}

/// Result of feeding one chunk into the registry.
pub enum ChunkOutcome {
    /// More chunks expected.
    Buffered,
    /// Final chunk arrived; the reassembled result, in index order.
    Complete(Value),
    /// No call with that id.
    Unknown,
}

/// All currently in-flight calls, by id.
#[derive(Default)]
pub struct Registry {
    calls: HashMap<ReqId, PendingCall>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call; the returned receiver resolves with its outcome.
    pub fn register(
        &mut self,
        id: ReqId,
        method: &str,
        params: Vec<Value>,
        replay: ReplayPolicy,
        post_process: Option<PostProcess>,
    ) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                params,
                replay,
                post_process,
                resolver: tx,
                chunks: Vec::new(),
                sent: false,
            },
        );
        rx
    }

    /// Record that the call was handed to a writer at least once. Replay
    /// only ever resends sent calls; unsent ones are still owned by their
    /// suspended send path.
    pub fn mark_sent(&mut self, id: ReqId) {
        if let Some(call) = self.calls.get_mut(&id) {
            call.sent = true;
        }
    }

    pub fn contains(&self, id: ReqId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Buffer a chunk; on the final chunk, sort by index ascending and
    /// concatenate the payload arrays. Arrival order is free.
    ///
    /// A result sliced into exactly one non-array chunk is a whole value
    /// that happened to ride the chunk envelope; it resolves as-is rather
    /// than wrapped in an array.
    pub fn append_chunk(
        &mut self,
        id: ReqId,
        index: u32,
        payload: Option<Value>,
        last: bool,
    ) -> ChunkOutcome {
        let Some(call) = self.calls.get_mut(&id) else {
            return ChunkOutcome::Unknown;
        };

        call.chunks.push((index, payload.unwrap_or(Value::Null)));

        if !last {
            return ChunkOutcome::Buffered;
        }

        call.chunks.sort_by_key(|(index, _)| *index);
        if call.chunks.len() == 1 && !matches!(call.chunks[0].1, Value::Array(_)) {
            let (_, payload) = call.chunks.remove(0);
            return ChunkOutcome::Complete(payload);
        }
        let mut result = Vec::new();
        for (_, payload) in call.chunks.drain(..) {
            match payload {
                Value::Array(items) => result.extend(items),
                Value::Null => {}
                other => result.push(other),
            }
        }
        ChunkOutcome::Complete(Value::Array(result))
    }

    /// Remove a call for resolution. `None` is a protocol-invariant
    /// violation the caller logs loudly.
    pub fn take(&mut self, id: ReqId) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Remove every call; used only by explicit close.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.calls.drain().map(|(_, call)| call).collect()
    }

    /// Snapshot of every *sent* call for reconnect replay, ascending by id
    /// so replay order matches issue order.
    pub fn replay_snapshot(&self) -> Vec<ReplayEntry> {
        let mut entries: Vec<ReplayEntry> = self
            .calls
            .iter()
            .filter(|(_, call)| call.sent)
            .map(|(id, call)| ReplayEntry {
                id: *id,
                method: call.method.clone(),
                params: call.params.clone(),
                replay: call.replay.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}
