//! Callback traits for subscriptions and services
//!
//! Both traits have blanket implementations for async closures, so the
//! usual registration is a closure:
//!
//! ```no_run
//! # use tagentacle_node::{Message, Node, MemoryTransport};
//! # let (transport, _daemon) = MemoryTransport::pair();
//! # let node = Node::new("listener", transport);
//! node.subscribe("/chat/global", |msg: Message| async move {
//!     println!("{} said {}", msg.sender, msg.payload);
//!     anyhow::Ok(())
//! });
//! node.service("/math/double", |req: serde_json::Value| async move {
//!     let n = req["n"].as_i64().unwrap_or(0);
//!     anyhow::Ok(serde_json::json!({ "n": n * 2 }))
//! })?;
//! # Ok::<(), tagentacle_node::NodeError>(())
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// A publication delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    /// Node id of the publisher
    pub sender: String,
    pub payload: Value,
}

/// Receives publications on a topic.
///
/// Callbacks run on the node's delivery task, not on the dispatch loop, so
/// a subscriber may call services. Callbacks for one frame run one after
/// another in registration order, and frames are delivered in arrival order.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_message(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Subscriber for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Answers requests for one service name.
///
/// Each request runs on its own task, so a handler may itself call other
/// services through the same node.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, request: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ServiceHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, request: Value) -> anyhow::Result<Value> {
        (self)(request).await
    }
}
