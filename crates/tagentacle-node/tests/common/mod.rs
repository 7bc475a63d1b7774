//! Common test utilities for node integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tagentacle_node::{DaemonHandle, EngineOptions, MemoryTransport, Message, Node, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long tests wait for something that should happen promptly.
pub const WAIT: Duration = Duration::from_millis(500);

pub fn fast_options() -> EngineOptions {
    EngineOptions {
        call_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
    }
}

/// A node wired to a scripted Daemon. Not connected yet.
pub fn scripted_node(node_id: &str) -> (Node, DaemonHandle) {
    let (transport, daemon) = MemoryTransport::pair();
    (Node::with_options(node_id, transport, fast_options()), daemon)
}

/// A node whose publications and service calls come back to itself.
pub fn loopback_node(node_id: &str) -> (Node, DaemonHandle) {
    let (transport, daemon) = MemoryTransport::loopback();
    (Node::with_options(node_id, transport, fast_options()), daemon)
}

/// Run `node.spin` on a background task.
pub fn spawn_spin(node: &Node) -> (CancellationToken, JoinHandle<Result<()>>) {
    let token = CancellationToken::new();
    let node = node.clone();
    let spin_token = token.clone();
    let handle = tokio::spawn(async move { node.spin(&spin_token).await });
    (token, handle)
}

/// Collects the messages a subscriber receives.
#[derive(Clone, Default)]
pub struct Inbox {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl Inbox {
    pub fn subscribe(&self, node: &Node, topic: &str) {
        let inbox = self.clone();
        node.subscribe(topic, move |msg: Message| {
            let inbox = inbox.clone();
            async move {
                inbox.push(msg);
                anyhow::Ok(())
            }
        });
    }

    pub fn push(&self, message: Message) {
        self.messages.lock().push(message);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }
}
