//! Raw socket seam.
//!
//! The lifecycle manager talks to the wire through [`SocketFactory`] and the
//! split [`SocketSink`]/[`SocketStream`] halves. Messages are opaque,
//! length-delimited frames (`bytes::Bytes`); framing belongs to the
//! transport, never to this crate.
//!
//! Implementations:
//! - [`ws::WsFactory`] - the default WebSocket transport
//! - [`memory`] - an in-process loopback used by the test suite

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod memory;
pub mod ws;

pub use memory::MemoryHub;
pub use ws::WsFactory;

/// Write half of a connected socket.
#[async_trait]
pub trait SocketSink: Send {
    /// Send one complete message frame.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Close the socket. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connected socket.
#[async_trait]
pub trait SocketStream: Send {
    /// Next inbound message frame; `None` once the socket is closed.
    async fn next(&mut self) -> Option<Result<Bytes>>;
}

/// A freshly dialed socket, already split.
pub struct SocketPair {
    pub sink: Box<dyn SocketSink>,
    pub stream: Box<dyn SocketStream>,
}

/// Dials a socket for a fully formed URL (session id already appended).
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketPair>;
}
