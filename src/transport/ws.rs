//! Default WebSocket transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{SocketFactory, SocketPair, SocketSink, SocketStream};
use crate::error::{LinkError, Result};

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `ws://`/`wss://` endpoints with `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsFactory;

#[async_trait]
impl SocketFactory for WsFactory {
    async fn connect(&self, url: &str) -> Result<SocketPair> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let (sink, stream) = ws.split();

        Ok(SocketPair {
            sink: Box::new(WsSink { inner: sink }),
            stream: Box::new(WsStream { inner: stream }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsConn, Message>,
}

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.inner
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        // A close error after the peer already went away is not interesting.
        let _ = self.inner.close().await;
        Ok(())
    }
}

struct WsStream {
    inner: SplitStream<WsConn>,
}

#[async_trait]
impl SocketStream for WsStream {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(Bytes::from(data))),
                Ok(Message::Text(text)) => return Some(Ok(Bytes::from(text.into_bytes()))),
                // Control frames are handled by tungstenite itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(LinkError::Transport(e.to_string()))),
            }
        }
    }
}
