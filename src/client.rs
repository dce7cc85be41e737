//! Connection facade.
//!
//! [`LinkBuilder`] wires up the transport, codec, session store and
//! callbacks, then [`LinkBuilder::connect`] spawns the lifecycle and
//! keepalive tasks and returns a cheap-to-share [`Link`]. Domain
//! operations map one-to-one onto remote methods and attach the right
//! replay policy to each.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::codec::{Codec, RpcCodec};
use crate::error::{LinkError, Result};
use crate::lifecycle::{
    run_keepalive, run_lifecycle, ConnectEvent, Core, Events, LinkConfig, ProtocolOptions,
    StaticOptions, TxHandler,
};
use crate::protocol::classes;
use crate::registry::{PostProcess, ReplayPolicy, RetryPredicate};
use crate::session::{KeyValueStore, MemoryStore, SessionIdentity};
use crate::transport::{SocketFactory, WsFactory};

/// Configures and opens a [`Link`].
///
/// ```no_run
/// # use storelink::LinkBuilder;
/// # async fn demo() {
/// let link = LinkBuilder::new("wss://store.example.com/ws", |txes| {
///     for tx in txes {
///         println!("broadcast: {tx}");
///     }
/// })
/// .on_connect(|event| println!("{event:?}"))
/// .connect();
///
/// let account = link.get_account().await;
/// # let _ = account;
/// # }
/// ```
pub struct LinkBuilder {
    url: String,
    handler: TxHandler,
    on_connect: Option<Box<dyn Fn(ConnectEvent) + Send + Sync>>,
    on_upgrade: Option<Box<dyn Fn() + Send + Sync>>,
    on_unauthorized: Option<Box<dyn Fn() + Send + Sync>>,
    on_activity: Option<Box<dyn Fn(i64) + Send + Sync>>,
    factory: Arc<dyn SocketFactory>,
    codec: Arc<dyn Codec>,
    store: Arc<dyn KeyValueStore>,
    options: Arc<dyn ProtocolOptions>,
    config: LinkConfig,
}

impl LinkBuilder {
    /// `handler` receives every broadcast transaction batch in server
    /// order.
    pub fn new(url: impl Into<String>, handler: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self {
            url: url.into(),
            handler: Arc::new(handler),
            on_connect: None,
            on_upgrade: None,
            on_unauthorized: None,
            on_activity: None,
            factory: Arc::new(WsFactory),
            codec: Arc::new(RpcCodec),
            store: Arc::new(MemoryStore::new()),
            options: Arc::new(StaticOptions::default()),
            config: LinkConfig::default(),
        }
    }

    /// Called after every successful handshake, with first-vs-reconnect
    /// distinguished.
    pub fn on_connect(mut self, cb: impl Fn(ConnectEvent) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(cb));
        self
    }

    /// Called when the server announces a model upgrade.
    pub fn on_upgrade(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_upgrade = Some(Box::new(cb));
        self
    }

    /// Called once if the handshake is refused for bad credentials; the
    /// link gives up permanently.
    pub fn on_unauthorized(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_unauthorized = Some(Box::new(cb));
        self
    }

    /// Network-activity signal: the pending-call count, or `-1` on a
    /// socket-level failure.
    pub fn on_activity(mut self, cb: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.on_activity = Some(Box::new(cb));
        self
    }

    /// Swap the socket transport; defaults to a websocket dialer.
    pub fn factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Where the session identity persists across link instances.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn options(mut self, options: Arc<dyn ProtocolOptions>) -> Self {
        self.options = options;
        self
    }

    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the lifecycle and keepalive tasks and return the link.
    ///
    /// Never blocks: the first connect happens in the background, and
    /// calls issued before it completes are queued.
    pub fn connect(self) -> Link {
        let session = SessionIdentity::new(self.store, &self.url);
        let events = Events {
            handler: self.handler,
            on_connect: self.on_connect,
            on_upgrade: self.on_upgrade,
            on_unauthorized: self.on_unauthorized,
            on_activity: self.on_activity,
        };
        let core = Arc::new(Core::new(
            self.url,
            self.config,
            self.factory,
            self.codec,
            self.options,
            session,
            events,
        ));

        let lifecycle = tokio::spawn(run_lifecycle(core.clone()));
        let keepalive = tokio::spawn(run_keepalive(core.clone()));
        Link {
            core,
            tasks: Mutex::new(vec![lifecycle, keepalive]),
        }
    }
}

/// One logical connection to a remote document store.
pub struct Link {
    core: Arc<Core>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    /// Escape hatch: issue an arbitrary idempotent call.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.core
            .call(method, params, ReplayPolicy::Idempotent, None)
            .await
    }

    /// Fetch the model transactions newer than `last_tx` (optionally
    /// validated against `hash`).
    pub async fn load_model(&self, last_tx: i64, hash: Option<String>) -> Result<Value> {
        let mut params = vec![json!(last_tx)];
        if let Some(hash) = hash {
            params.push(json!(hash));
        }
        self.call("loadModel", params).await
    }

    pub async fn get_account(&self) -> Result<Value> {
        self.call("getAccount", Vec::new()).await
    }

    /// Query the store. Logs a warning when a single query takes longer
    /// than a second.
    pub async fn find_all(&self, class: &str, query: Value, options: Value) -> Result<Vec<Value>> {
        let started = Instant::now();
        let result = self
            .call("findAll", vec![json!(class), query, options])
            .await?;
        let elapsed = started.elapsed();
        if elapsed.as_millis() > 1000 {
            tracing::warn!(class, elapsed_ms = elapsed.as_millis() as u64, "slow findAll");
        }
        match result {
            Value::Array(docs) => Ok(docs),
            Value::Null => Ok(Vec::new()),
            other => Err(LinkError::Protocol(format!(
                "findAll returned non-array: {other}"
            ))),
        }
    }

    /// Apply one transaction.
    ///
    /// Replay after a reconnect first probes whether the transaction
    /// already landed, so it is applied at most once. Derived server-side
    /// transactions piggybacked on the result are re-delivered through the
    /// broadcast handler.
    pub async fn tx(&self, tx: Value) -> Result<Value> {
        let replay = match tx_probe_id(&tx) {
            Some(probe_id) => {
                let weak = Arc::downgrade(&self.core);
                let predicate: RetryPredicate = Arc::new(move || {
                    let weak = weak.clone();
                    let probe_id = probe_id.clone();
                    Box::pin(async move {
                        let Some(core) = weak.upgrade() else {
                            return false;
                        };
                        let found = core
                            .call(
                                "findAll",
                                vec![
                                    json!(classes::TX),
                                    json!({ "_id": probe_id }),
                                    json!({ "limit": 1 }),
                                ],
                                ReplayPolicy::Idempotent,
                                None,
                            )
                            .await;
                        // Resend only when the probe proves it never landed.
                        matches!(found, Ok(Value::Array(docs)) if docs.is_empty())
                    })
                });
                ReplayPolicy::ConditionalRetry(predicate)
            }
            // Without an id to probe, resending could double-apply.
            None => ReplayPolicy::NoRetry,
        };

        let handler = self.core.events.handler.clone();
        let post: PostProcess = Arc::new(move |result: Value| {
            let handler = handler.clone();
            Box::pin(async move {
                if let Some(derived) = result.get("derivedTx").and_then(Value::as_array) {
                    if !derived.is_empty() {
                        handler(derived.clone());
                    }
                }
            })
        });

        self.core.call("tx", vec![tx], replay, Some(post)).await
    }

    /// Open or advance a domain export cursor.
    pub async fn load_chunk(&self, domain: &str, idx: Option<i64>) -> Result<Value> {
        self.call("loadChunk", vec![json!(domain), json!(idx)]).await
    }

    pub async fn close_chunk(&self, idx: i64) -> Result<()> {
        self.call("closeChunk", vec![json!(idx)]).await?;
        Ok(())
    }

    /// Upsert raw documents into a domain.
    pub async fn upload(&self, domain: &str, docs: Vec<Value>) -> Result<Value> {
        self.call("upload", vec![json!(domain), Value::Array(docs)])
            .await
    }

    /// Delete documents from a domain by id.
    pub async fn clean(&self, domain: &str, docs: Vec<Value>) -> Result<Value> {
        self.call("clean", vec![json!(domain), Value::Array(docs)])
            .await
    }

    pub async fn search_fulltext(&self, query: Value, options: Value) -> Result<Value> {
        self.call("searchFulltext", vec![query, options]).await
    }

    /// Server-side measurement scope control.
    pub async fn measure(&self, operation: &str) -> Result<Value> {
        self.call("measure", vec![json!(operation)]).await
    }

    pub async fn measure_done(&self, operation: &str) -> Result<Value> {
        self.call("measure-done", vec![json!(operation)]).await
    }

    /// Calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.core.pending_count()
    }

    /// Close the link: new and pending calls are rejected immediately, the
    /// socket is shut down, and both background tasks are joined before
    /// returning. Idempotent.
    pub async fn close(&self) {
        self.core
            .closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.core.shutdown.send_replace(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("tasks poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// The document id a reconnect probe should look for, mirroring how the
/// server journals applied transactions.
fn tx_probe_id(tx: &Value) -> Option<Value> {
    if tx.get("_class").and_then(Value::as_str) == Some(classes::TX_APPLY_IF) {
        return tx
            .get("txes")
            .and_then(Value::as_array)
            .and_then(|txes| txes.first())
            .and_then(|first| first.get("_id"))
            .cloned();
    }
    tx.get("_id").cloned()
}
