//! The simple node API

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tagentacle_config::NodeConfig;
use tokio_util::sync::CancellationToken;

use crate::engine::{DispatchEngine, EngineOptions};
use crate::error::Result;
use crate::handler::{ServiceHandler, Subscriber};
use crate::registry::{ServiceHandle, SubscriptionHandle};
use crate::transport::Transport;

/// A participant on the bus.
///
/// Cheap to clone: clones share one connection, one set of registries and
/// one dispatch loop, so a clone can be moved into a handler to publish or
/// call other services from inside it.
///
/// ```no_run
/// # use tagentacle_node::{MemoryTransport, Message, Node};
/// # use tokio_util::sync::CancellationToken;
/// # async fn run() -> tagentacle_node::Result<()> {
/// let (transport, _daemon) = MemoryTransport::pair();
/// let node = Node::new("greeter", transport);
/// node.subscribe("/chat/global", |msg: Message| async move {
///     println!("{}: {}", msg.sender, msg.payload);
///     anyhow::Ok(())
/// });
/// node.connect().await?;
/// node.publish("/chat/global", serde_json::json!({"text": "Hello!"})).await?;
/// node.spin(&CancellationToken::new()).await
/// # }
/// ```
#[derive(Clone)]
pub struct Node {
    engine: Arc<DispatchEngine>,
    secrets: Arc<HashMap<String, String>>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::with_options(node_id, transport, EngineOptions::default())
    }

    pub fn with_options(
        node_id: impl Into<String>,
        transport: impl Transport + 'static,
        options: EngineOptions,
    ) -> Self {
        Self {
            engine: Arc::new(DispatchEngine::new(
                node_id.into(),
                Arc::new(transport),
                options,
            )),
            secrets: Arc::new(HashMap::new()),
        }
    }

    /// Build a node from loaded configuration. `secrets` is whatever the
    /// embedder read from the secrets file, usually
    /// [`load_secrets_from_env`](tagentacle_config::load_secrets_from_env).
    pub fn from_config(
        node_id: impl Into<String>,
        transport: impl Transport + 'static,
        config: &NodeConfig,
        secrets: HashMap<String, String>,
    ) -> Self {
        Self::with_options(node_id, transport, EngineOptions::from(config)).with_secrets(secrets)
    }

    /// Attach secrets. Existing clones keep the secrets they were made with.
    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }

    pub fn secrets(&self) -> &HashMap<String, String> {
        &self.secrets
    }

    pub fn secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(String::as_str)
    }

    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    pub fn options(&self) -> EngineOptions {
        self.engine.options()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Number of service calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.engine.pending_calls()
    }

    /// Connect to the Daemon and announce every registered topic and
    /// service. Succeeds immediately when already connected.
    pub async fn connect(&self) -> Result<()> {
        self.engine.connect().await
    }

    /// Drop the connection. Pending calls fail with
    /// [`NodeError::Cancelled`](crate::NodeError::Cancelled); subscriptions
    /// and services stay registered for the next `connect`.
    pub async fn disconnect(&self) {
        self.engine.disconnect().await
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.engine.publish(topic, payload).await
    }

    /// Register a callback for `topic`. Several callbacks may share a
    /// topic; they run in the order they were registered.
    pub fn subscribe<S>(&self, topic: &str, subscriber: S) -> SubscriptionHandle
    where
        S: Subscriber + 'static,
    {
        self.engine
            .register_subscription(topic, Arc::new(subscriber))
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.engine.unregister_subscription(handle)
    }

    /// Register the handler for service `name`.
    ///
    /// Fails with [`NodeError::DuplicateService`](crate::NodeError::DuplicateService)
    /// if the name is taken; the existing handler stays in place.
    pub fn service<H>(&self, name: &str, handler: H) -> Result<ServiceHandle>
    where
        H: ServiceHandler + 'static,
    {
        self.engine.register_service(name, Arc::new(handler))
    }

    /// Call a service and wait for the response.
    ///
    /// `timeout` of `None` uses the node's configured call timeout. The
    /// response only arrives while something is spinning the node.
    pub async fn call_service(
        &self,
        service: &str,
        payload: Value,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<Value> {
        let timeout = self.resolve_timeout(timeout.into());
        self.engine
            .call_service(service, payload, timeout, None)
            .await
    }

    /// [`call_service`](Self::call_service) that also gives up with
    /// [`NodeError::Cancelled`](crate::NodeError::Cancelled) when `cancel`
    /// fires.
    pub async fn call_service_with_cancel(
        &self,
        service: &str,
        payload: Value,
        timeout: impl Into<Option<Duration>>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let timeout = self.resolve_timeout(timeout.into());
        self.engine
            .call_service(service, payload, timeout, Some(cancel))
            .await
    }

    fn resolve_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.engine.options().call_timeout)
    }

    /// Run the dispatch loop.
    ///
    /// Returns `Ok(())` when `token` is cancelled (the frame being routed
    /// at that moment finishes first), when [`disconnect`](Self::disconnect)
    /// is called, or when the Daemon hangs up. Any other transport failure
    /// disconnects the node and is returned as
    /// [`NodeError::Connection`](crate::NodeError::Connection).
    pub async fn spin(&self, token: &CancellationToken) -> Result<()> {
        self.engine.run(token).await
    }

    /// One dispatch loop iteration, waiting up to `wait` for a frame.
    /// Returns whether a frame was routed.
    ///
    /// Unlike [`spin`](Self::spin), this waits until every subscriber has
    /// seen a routed publication.
    pub async fn spin_once(&self, wait: Duration) -> Result<bool> {
        self.engine.dispatch_once(wait).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id())
            .field("connected", &self.is_connected())
            .field("secrets", &self.secrets.len())
            .finish()
    }
}
