//! A managed node talking to itself over a loopback transport.
//!
//! ```text
//! RUST_LOG=debug cargo run -p tagentacle-node --example loopback_chat
//! ```

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tagentacle_config::{init_logging, NodeConfig};
use tagentacle_node::{ConfigMap, LifecycleHooks, LifecycleNode, MemoryTransport, Message, Node};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Chat {
    greeting: String,
}

#[async_trait]
impl LifecycleHooks for Chat {
    async fn on_configure(&mut self, _node: &Node, config: &ConfigMap) -> anyhow::Result<()> {
        if let Some(greeting) = config.get("greeting").and_then(|v| v.as_str()) {
            self.greeting = greeting.to_string();
        }
        Ok(())
    }

    async fn on_activate(&mut self, node: &Node) -> anyhow::Result<()> {
        node.publish("/chat/global", json!({ "text": self.greeting }))
            .await?;
        Ok(())
    }

    async fn on_shutdown(&mut self, node: &Node) -> anyhow::Result<()> {
        info!("{} leaving the chat", node.node_id());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info");

    let config = NodeConfig::from_env()?;
    let secrets = config.load_secrets()?;
    let (transport, _daemon) = MemoryTransport::loopback();
    let node = Node::from_config("chatter", transport, &config, secrets);

    let managed = LifecycleNode::new(
        node,
        Chat {
            greeting: "Hello!".to_string(),
        },
    );
    managed.subscribe("/chat/global", |msg: Message| async move {
        info!("{} said {}", msg.sender, msg.payload);
        anyhow::Ok(())
    });
    managed
        .service("/chat/shout", |req: serde_json::Value| async move {
            let text = req["text"].as_str().unwrap_or_default().to_uppercase();
            anyhow::Ok(json!({ "text": text }))
        })?;

    let mut settings = ConfigMap::new();
    settings.insert("greeting".to_string(), json!("Hello from the loopback!"));
    managed.bringup(settings).await?;

    let token = CancellationToken::new();
    let spinner = {
        let node = managed.node().clone();
        let token = token.clone();
        tokio::spawn(async move { node.spin(&token).await })
    };

    let shouted = managed
        .node()
        .call_service("/chat/shout", json!({"text": "anyone there?"}), Duration::from_secs(1))
        .await?;
    info!("Shout service answered {}", shouted);

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    spinner.await??;
    managed.shutdown().await?;
    Ok(())
}
