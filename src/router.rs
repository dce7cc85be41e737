//! Request send path.
//!
//! Allocates correlation ids, registers calls in the pending registry, and
//! waits for the link to be Open before writing. A call registered while
//! disconnected is written exactly once: its own send path flushes it after
//! the reconnect, and the replay pass only touches calls already marked
//! sent.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{LinkError, Result};
use crate::lifecycle::{Core, LinkState, OpenLink};
use crate::protocol::Request;
use crate::registry::{PostProcess, ReplayPolicy};

impl Core {
    /// Issue one remote call and wait for its (reassembled) result.
    pub(crate) async fn call(
        self: &Arc<Self>,
        method: &str,
        params: Vec<Value>,
        replay: ReplayPolicy,
        post_process: Option<PostProcess>,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(LinkError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .registry
            .lock()
            .expect("registry poisoned")
            .register(id, method, params.clone(), replay, post_process);
        self.events.activity(self.pending_count() as i64);

        let request = Request {
            method: method.to_string(),
            params,
            id,
        };
        loop {
            let link = match self.wait_open().await {
                Ok(link) => link,
                Err(err) => {
                    self.registry.lock().expect("registry poisoned").take(id);
                    return Err(err);
                }
            };

            match self.write_request(&link, &request).await {
                Ok(()) => {
                    self.registry.lock().expect("registry poisoned").mark_sent(id);
                    break;
                }
                Err(_) => {
                    // The writer died under us and the frame never reached
                    // the wire. The call is still unsent, so replay ignores
                    // it; once this link leaves the published state, write
                    // again on the fresh one.
                    if !self.registry.lock().expect("registry poisoned").contains(id) {
                        break;
                    }
                    tracing::debug!(id, method, "write failed, retrying after reconnect");
                    if self.outlive_link(&link).await.is_err() {
                        self.registry.lock().expect("registry poisoned").take(id);
                        return Err(LinkError::ConnectionClosed);
                    }
                }
            }
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(LinkError::Rpc(err)),
            Err(_) => Err(LinkError::ConnectionClosed),
        }
    }

    /// Wait until the published state no longer names `stale`, so a failed
    /// write is never retried against the same dead writer.
    async fn outlive_link(&self, stale: &OpenLink) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                LinkState::Open(open) if open.writer.same_channel(&stale.writer) => {}
                _ => return Ok(()),
            }
            if rx.changed().await.is_err() {
                return Err(LinkError::ConnectionClosed);
            }
        }
    }

    /// Block until the link is Open. All concurrent senders observe the
    /// same watch channel, so one reconnect serves them all.
    pub(crate) async fn wait_open(&self) -> Result<OpenLink> {
        let mut rx = self.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                LinkState::Open(link) => return Ok(link),
                LinkState::Closed => return Err(LinkError::ConnectionClosed),
                LinkState::Idle | LinkState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(LinkError::ConnectionClosed);
            }
        }
    }
}
