//! storelink - resilient multiplexed RPC client for a remote document
//! store.
//!
//! One [`Link`] maintains one logical connection across any number of
//! physical sockets: it dials with capped backoff, performs the `hello`
//! handshake, multiplexes concurrent calls over correlation ids,
//! reassembles chunked large results, detects hung sockets via keepalive
//! pings, and replays in-flight calls after a reconnect according to each
//! call's idempotency policy. Callers never see the outages; a call issued
//! while disconnected simply resolves once the link is back.
//!
//! # Quick start
//!
//! ```no_run
//! use storelink::LinkBuilder;
//!
//! # async fn demo() -> storelink::Result<()> {
//! let link = LinkBuilder::new("wss://store.example.com/ws", |txes| {
//!     println!("broadcast batch of {}", txes.len());
//! })
//! .connect();
//!
//! let spaces = link
//!     .find_all(
//!         "core:class:Space",
//!         serde_json::json!({}),
//!         serde_json::json!({ "limit": 10 }),
//!     )
//!     .await?;
//! println!("{} spaces", spaces.len());
//!
//! link.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - wire envelope shapes (requests, responses, chunks)
//! - [`codec`] - JSON/MsgPack envelope encoding
//! - [`transport`] - raw socket seam, WebSocket and in-memory loopback
//! - [`registry`] - pending call registry and replay policies
//! - [`session`] - persistent per-URL session identity
//! - [`error`] - the [`LinkError`] type

pub mod codec;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

mod backoff;
mod client;
mod lifecycle;
mod router;

pub use client::{Link, LinkBuilder};
pub use error::{LinkError, Result};
pub use lifecycle::{ConnectEvent, LinkConfig, ProtocolOptions, StaticOptions, TxHandler};
pub use registry::ReplayPolicy;
