//! Connection lifecycle manager.
//!
//! One background task owns the socket for the whole life of a
//! [`crate::Link`]: it dials with capped backoff, performs the `hello`
//! handshake, replays in-flight calls after a reconnect, and dispatches
//! every inbound message (correlated replies, broadcast batches, upgrade
//! notices). Outbound frames funnel through a dedicated writer task so
//! concurrent senders never touch the socket directly.
//!
//! State machine:
//!
//! ```text
//! Idle ─► Connecting ─► Open ─► Connecting (error/close) ─► ...
//!                         │
//!                         └─► Closed (explicit close, from any state)
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::codec::Codec;
use crate::error::{LinkError, Result};
use crate::protocol::{
    broadcast_batch, is_upgrade_event, HelloRequest, ReqId, Request, Response, CONTROL_ID,
    PING_METHOD, UPGRADING_METHOD,
};
use crate::registry::{ChunkOutcome, Registry, ReplayPolicy};
use crate::session::SessionIdentity;
use crate::transport::{SocketFactory, SocketPair, SocketSink, SocketStream};

/// Distinguishes the first successful handshake from later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectEvent {
    Connected,
    Reconnected,
}

/// Receives every broadcast transaction batch, in server order.
pub type TxHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Binary/compression flags announced in the `hello` frame.
///
/// Re-read on every reconnect, so they may change between attempts.
pub trait ProtocolOptions: Send + Sync {
    fn binary(&self) -> bool;
    fn compression(&self) -> bool;
}

/// Fixed protocol options; the default.
#[derive(Debug, Clone, Copy)]
pub struct StaticOptions {
    pub binary: bool,
    pub compression: bool,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            binary: true,
            compression: false,
        }
    }
}

impl ProtocolOptions for StaticOptions {
    fn binary(&self) -> bool {
        self.binary
    }

    fn compression(&self) -> bool {
        self.compression
    }
}

/// Timer knobs. Production defaults match the store protocol; tests shrink
/// them.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Dial plus `hello` ack budget for one connect attempt.
    pub dial_timeout: Duration,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
    /// Stale-watermark threshold that forces a socket close.
    pub hang_timeout: Duration,
    /// Coalescing window for the network-activity signal on broadcasts.
    pub activity_debounce: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(10),
            hang_timeout: Duration::from_secs(5 * 60),
            activity_debounce: Duration::from_millis(500),
        }
    }
}

/// Callbacks surfaced to the embedding application.
pub(crate) struct Events {
    pub handler: TxHandler,
    pub on_connect: Option<Box<dyn Fn(ConnectEvent) + Send + Sync>>,
    pub on_upgrade: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_unauthorized: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_activity: Option<Box<dyn Fn(i64) + Send + Sync>>,
}

impl Events {
    pub(crate) fn connected(&self, event: ConnectEvent) {
        if let Some(cb) = &self.on_connect {
            cb(event);
        }
    }

    pub(crate) fn upgrade(&self) {
        if let Some(cb) = &self.on_upgrade {
            cb();
        }
    }

    pub(crate) fn unauthorized(&self) {
        if let Some(cb) = &self.on_unauthorized {
            cb();
        }
    }

    /// Pending-count change; `-1` signals a socket-level failure.
    pub(crate) fn activity(&self, pending: i64) {
        if let Some(cb) = &self.on_activity {
            cb(pending);
        }
    }
}

/// Handle to the writer task of the currently open socket.
#[derive(Clone)]
pub(crate) struct OpenLink {
    pub writer: mpsc::Sender<Bytes>,
    /// Envelope mode for this session, taken from the `hello` ack.
    pub binary: bool,
}

/// Connection state, published through a watch channel so every concurrent
/// sender shares the single in-flight connect.
#[derive(Clone, Default)]
pub(crate) enum LinkState {
    #[default]
    Idle,
    Connecting,
    Open(OpenLink),
    Closed,
}

/// Everything the lifecycle task, the router and the facade share.
pub(crate) struct Core {
    pub url: String,
    pub config: LinkConfig,
    pub factory: Arc<dyn SocketFactory>,
    pub codec: Arc<dyn Codec>,
    pub options: Arc<dyn ProtocolOptions>,
    pub session: SessionIdentity,
    pub events: Events,
    pub registry: Mutex<Registry>,
    pub next_id: AtomicI64,
    pub state: watch::Sender<LinkState>,
    pub last_alive: Mutex<Instant>,
    /// Bumped by the keepalive supervisor to force-close a hung socket.
    pub hang_signal: watch::Sender<u64>,
    pub shutdown: watch::Sender<bool>,
    pub closed: AtomicBool,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

/// One successfully handshaken socket.
struct OpenSession {
    link: OpenLink,
    stream: Box<dyn SocketStream>,
    writer_stop: oneshot::Sender<()>,
    writer_task: JoinHandle<()>,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        url: String,
        config: LinkConfig,
        factory: Arc<dyn SocketFactory>,
        codec: Arc<dyn Codec>,
        options: Arc<dyn ProtocolOptions>,
        session: SessionIdentity,
        events: Events,
    ) -> Self {
        Self {
            url,
            config,
            factory,
            codec,
            options,
            session,
            events,
            registry: Mutex::new(Registry::new()),
            next_id: AtomicI64::new(0),
            state: watch::Sender::new(LinkState::Idle),
            last_alive: Mutex::new(Instant::now()),
            hang_signal: watch::Sender::new(0),
            shutdown: watch::Sender::new(false),
            closed: AtomicBool::new(false),
            debounce: Mutex::new(None),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.registry.lock().expect("registry poisoned").len()
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    /// Encode and queue one request on the open link.
    pub(crate) async fn write_request(&self, link: &OpenLink, request: &Request) -> Result<()> {
        let envelope = serde_json::to_value(request)?;
        let frame = self.codec.serialize(&envelope, link.binary)?;
        link.writer
            .send(frame)
            .await
            .map_err(|_| LinkError::ConnectionClosed)
    }

    /// Fire-and-forget control frame (`#upgrading`); always text mode.
    fn send_control(&self, link: &OpenLink, method: &str) {
        let Ok(envelope) = serde_json::to_value(Request::control(method)) else {
            return;
        };
        if let Ok(frame) = self.codec.serialize(&envelope, false) {
            let _ = link.writer.try_send(frame);
        }
    }

    /// One dial + handshake, bounded by the dial timeout.
    async fn connect_attempt(self: &Arc<Self>) -> Result<OpenSession> {
        let session_id = self.session.ensure();
        let url = format!("{}?sessionId={}", self.url, session_id);

        match tokio::time::timeout(self.config.dial_timeout, self.handshake(&url)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::DialTimeout),
        }
    }

    async fn handshake(self: &Arc<Self>, url: &str) -> Result<OpenSession> {
        let SocketPair { mut sink, mut stream } = self.factory.connect(url).await?;

        // Flags are re-read on every attempt; the hello itself is text mode.
        let hello = HelloRequest::new(self.options.binary(), self.options.compression());
        let frame = self
            .codec
            .serialize(&serde_json::to_value(&hello)?, false)?;
        sink.send(frame).await?;

        // Frames the server sends before the ack (broadcasts, mostly) are
        // held back and dispatched once the link is up.
        let mut early: Vec<Bytes> = Vec::new();

        loop {
            let Some(frame) = stream.next().await else {
                return Err(LinkError::Transport(
                    "socket closed before hello ack".to_string(),
                ));
            };
            let frame = frame?;
            let resp = self.codec.read_response(&frame, false)?;
            if resp.id != Some(CONTROL_ID) {
                early.push(frame);
                continue;
            }

            if let Some(err) = resp.error {
                if err.is_unauthorized() {
                    return Err(LinkError::Unauthorized);
                }
                return Err(LinkError::Rpc(err));
            }

            let ack = resp.hello_ack();
            if ack.already_connected {
                // The previous socket still holds this session id; never let
                // two sockets race under one id.
                self.session.regenerate();
                return Err(LinkError::AlreadyConnected);
            }

            let (writer_tx, writer_rx) = mpsc::channel(64);
            let (stop_tx, stop_rx) = oneshot::channel();
            let writer_task = tokio::spawn(writer_loop(writer_rx, stop_rx, sink));
            let link = OpenLink {
                writer: writer_tx,
                binary: ack.binary,
            };

            // A fresh socket is alive by definition; a stale watermark from
            // the outage would re-trip the hang detector immediately.
            *self.last_alive.lock().expect("watermark poisoned") = Instant::now();

            self.replay_pending(&link);

            // Pre-ack frames were sent before the mode switch, so they
            // decode as text regardless of what the ack granted.
            let text_link = OpenLink {
                writer: link.writer.clone(),
                binary: false,
            };
            for frame in early {
                self.dispatch_inbound(&frame, &text_link);
            }

            self.events.connected(if ack.reconnect {
                ConnectEvent::Reconnected
            } else {
                ConnectEvent::Connected
            });

            return Ok(OpenSession {
                link,
                stream,
                writer_stop: stop_tx,
                writer_task,
            });
        }
    }

    /// Resend every already-sent pending call according to its replay
    /// policy. Fire-and-forget per call: predicates may issue their own
    /// calls over this very link, which only flushes once Open is
    /// published.
    fn replay_pending(self: &Arc<Self>, link: &OpenLink) {
        let entries = self
            .registry
            .lock()
            .expect("registry poisoned")
            .replay_snapshot();
        if entries.is_empty() {
            return;
        }
        tracing::debug!(count = entries.len(), "replaying in-flight calls");

        for entry in entries {
            let core = self.clone();
            let link = link.clone();
            tokio::spawn(async move {
                let resend = match &entry.replay {
                    ReplayPolicy::Idempotent => true,
                    ReplayPolicy::NoRetry => false,
                    ReplayPolicy::ConditionalRetry(predicate) => predicate().await,
                };
                if !resend {
                    tracing::debug!(id = entry.id, method = %entry.method, "replay skipped");
                    return;
                }
                // The call may have resolved while the predicate ran.
                if !core
                    .registry
                    .lock()
                    .expect("registry poisoned")
                    .contains(entry.id)
                {
                    return;
                }
                let request = Request {
                    method: entry.method,
                    params: entry.params,
                    id: entry.id,
                };
                if let Err(err) = core.write_request(&link, &request).await {
                    tracing::debug!(id = request.id, error = %err, "replay write failed");
                }
            });
        }
    }

    /// Read from the open socket until it dies, the hang detector fires, or
    /// shutdown is requested.
    async fn run_open(self: &Arc<Self>, session: OpenSession) {
        let OpenSession {
            link,
            mut stream,
            writer_stop,
            writer_task,
        } = session;

        let mut shutdown = self.shutdown.subscribe();
        let mut hang = self.hang_signal.subscribe();
        hang.borrow_and_update();

        self.set_state(LinkState::Open(link.clone()));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = hang.changed() => {
                    if changed.is_ok() {
                        tracing::warn!("liveness watermark stale, closing socket to force reconnect");
                    }
                    break;
                }
                frame = stream.next() => match frame {
                    Some(Ok(bytes)) => self.dispatch_inbound(&bytes, &link),
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "socket read error");
                        break;
                    }
                    None => {
                        tracing::debug!("socket closed by peer");
                        break;
                    }
                }
            }
        }

        let _ = writer_stop.send(());
        let _ = writer_task.await;
        if !self.is_closed() {
            self.set_state(LinkState::Connecting);
        }
    }

    fn dispatch_inbound(self: &Arc<Self>, bytes: &[u8], link: &OpenLink) {
        let resp = match self.codec.read_response(bytes, link.binary) {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable inbound message");
                return;
            }
        };

        if resp.id.is_none() && resp.is_ping_prompt() {
            // Server-prompted keepalive; answered like any other call.
            let core = self.clone();
            tokio::spawn(async move {
                let _ = core
                    .call(PING_METHOD, Vec::new(), ReplayPolicy::Idempotent, None)
                    .await;
            });
            return;
        }

        match resp.id {
            Some(CONTROL_ID) => tracing::debug!("stray control ack"),
            Some(id) => self.handle_reply(id, resp),
            None => self.handle_broadcast(resp, link),
        }
    }

    /// A correlated reply: chunk buffering, error envelopes, resolution.
    fn handle_reply(self: &Arc<Self>, id: ReqId, mut resp: Response) {
        let mut registry = self.registry.lock().expect("registry poisoned");

        if let Some(chunk) = resp.chunk.take() {
            match registry.append_chunk(id, chunk.index, resp.result.take(), chunk.last) {
                ChunkOutcome::Buffered => return,
                ChunkOutcome::Complete(result) => resp.result = Some(result),
                ChunkOutcome::Unknown => {
                    drop(registry);
                    tracing::error!(id, "chunk for unknown call id");
                    return;
                }
            }
        }

        let Some(call) = registry.take(id) else {
            drop(registry);
            // Protocol-invariant violation; the connection stays up.
            tracing::error!(id, "response for unknown call id");
            return;
        };
        let pending = registry.len() as i64;
        drop(registry);

        match resp.error {
            Some(err) => {
                let params = Value::Array(call.params.clone());
                tracing::error!(
                    method = %call.method,
                    id,
                    params = %params,
                    error = %err,
                    "remote call failed"
                );
                call.complete(Err(err));
            }
            None => call.complete(Ok(resp.result.unwrap_or(Value::Null))),
        }

        self.events.activity(pending);
    }

    /// A broadcast batch: upgrade notices short-circuit, everything else is
    /// handed to the transaction handler in server order, once per message.
    fn handle_broadcast(self: &Arc<Self>, resp: Response, link: &OpenLink) {
        let batch = broadcast_batch(resp.result);

        if batch.iter().any(is_upgrade_event) {
            tracing::debug!("server announced model upgrade");
            self.send_control(link, UPGRADING_METHOD);
            self.events.upgrade();
            return;
        }

        if !batch.is_empty() {
            (self.events.handler)(batch);
        }
        self.emit_activity_debounced();
    }

    /// Emit `pending + 1` now and a coalesced `pending` once the broadcast
    /// burst settles.
    fn emit_activity_debounced(self: &Arc<Self>) {
        let pending = self.pending_count() as i64;
        self.events.activity(pending + 1);

        let core = self.clone();
        let mut slot = self.debounce.lock().expect("debounce poisoned");
        if let Some(prev) = slot.take() {
            prev.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(core.config.activity_debounce).await;
            core.events.activity(core.pending_count() as i64);
        }));
    }

    /// Terminal teardown: publish Closed and reject everything still
    /// pending.
    fn finish_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(LinkState::Closed);

        if let Some(task) = self
            .debounce
            .lock()
            .expect("debounce poisoned")
            .take()
        {
            task.abort();
        }

        // Dropping the resolvers rejects every waiter with ConnectionClosed.
        let calls = self.registry.lock().expect("registry poisoned").drain();
        if !calls.is_empty() {
            tracing::debug!(count = calls.len(), "rejecting pending calls on close");
        }
        drop(calls);
    }
}

/// The connect loop: backoff on transient failures, terminal on
/// authorization failure or explicit close.
pub(crate) async fn run_lifecycle(core: Arc<Core>) {
    let mut shutdown = core.shutdown.subscribe();
    let mut backoff = Backoff::new();

    loop {
        if core.is_closed() || *shutdown.borrow() {
            break;
        }
        core.set_state(LinkState::Connecting);

        let attempt = tokio::select! {
            _ = shutdown.changed() => break,
            attempt = core.connect_attempt() => attempt,
        };

        match attempt {
            Ok(session) => {
                backoff.note_success();
                core.run_open(session).await;
                core.events.activity(-1);
            }
            Err(LinkError::Unauthorized) => {
                tracing::error!("handshake refused, giving up");
                core.events.unauthorized();
                break;
            }
            Err(err) => {
                let delay = backoff.next_delay();
                tracing::debug!(
                    error = %err,
                    delay_secs = delay.as_secs(),
                    "connect failed, backing off"
                );
                core.events.activity(-1);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    core.finish_closed();
}

/// Keepalive supervisor: ping on a fixed cadence while Open, track the
/// liveness watermark, and force a socket close when it goes stale.
pub(crate) async fn run_keepalive(core: Arc<Core>) {
    let mut shutdown = core.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(core.config.ping_interval) => {}
        }
        if core.is_closed() {
            break;
        }
        if !matches!(&*core.state.borrow(), LinkState::Open(_)) {
            continue;
        }

        let stale = core
            .last_alive
            .lock()
            .expect("watermark poisoned")
            .elapsed();
        if stale > core.config.hang_timeout {
            tracing::warn!(
                stale_secs = stale.as_secs(),
                "no keepalive liveness, forcing socket close"
            );
            // Reset so the close fires exactly once per hang.
            *core.last_alive.lock().expect("watermark poisoned") = Instant::now();
            core.hang_signal.send_modify(|n| *n += 1);
            continue;
        }

        let core = core.clone();
        tokio::spawn(async move {
            if core
                .call(PING_METHOD, Vec::new(), ReplayPolicy::Idempotent, None)
                .await
                .is_ok()
            {
                *core.last_alive.lock().expect("watermark poisoned") = Instant::now();
            }
        });
    }
}

/// Dedicated writer task: the only code touching the socket's write half.
async fn writer_loop(
    mut rx: mpsc::Receiver<Bytes>,
    mut stop: oneshot::Receiver<()>,
    mut sink: Box<dyn SocketSink>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(frame).await {
                        tracing::debug!(error = %err, "socket write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sink.close().await;
}
