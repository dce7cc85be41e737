//! In-process loopback transport.
//!
//! Lets tests play the server side of a connection without a real socket:
//! every [`MemoryHub::connect`] call yields a [`ServerEnd`] on the hub's
//! accept queue, and the hub can be switched into a refusing state to
//! exercise the reconnect/backoff paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::{SocketFactory, SocketPair, SocketSink, SocketStream};
use crate::error::{LinkError, Result};

/// Loopback socket factory plus the server-side accept queue.
pub struct MemoryHub {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
    refusing: AtomicBool,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            refusing: AtomicBool::new(false),
        })
    }

    /// Next dialed connection, in dial order.
    pub async fn accept(&self) -> Option<ServerEnd> {
        self.accept_rx.lock().await.recv().await
    }

    /// While `true`, every dial fails with a transport error.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketFactory for MemoryHub {
    async fn connect(&self, url: &str) -> Result<SocketPair> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(LinkError::Transport("connection refused".to_string()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let server = ServerEnd {
            url: url.to_string(),
            rx: from_client,
            tx: Some(to_client),
        };
        self.accept_tx
            .send(server)
            .map_err(|_| LinkError::Transport("hub dropped".to_string()))?;

        Ok(SocketPair {
            sink: Box::new(MemorySink {
                tx: Some(to_server),
            }),
            stream: Box::new(MemoryStream { rx: from_server }),
        })
    }
}

/// Server side of one loopback connection.
pub struct ServerEnd {
    /// The URL the client dialed, session id query included.
    pub url: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ServerEnd {
    /// Next frame the client wrote; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Push a frame to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: Bytes) -> bool {
        self.tx
            .as_ref()
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// JSON convenience for scripted test servers.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send(Bytes::from(serde_json::to_vec(value).expect("json")))
    }

    /// Drop the server-to-client direction; the client observes a closed
    /// socket.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl SocketSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| LinkError::Transport("peer closed".to_string())),
            None => Err(LinkError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl SocketStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await.map(Ok)
    }
}
