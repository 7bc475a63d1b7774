//! Managed lifecycle: transition rules, hook ordering and callback gating.

mod common;

use async_trait::async_trait;
use common::{loopback_node, scripted_node, spawn_spin, Inbox, WAIT};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tagentacle_node::{
    ConfigMap, Envelope, LifecycleHooks, LifecycleNode, LifecycleState, Message, Node, NodeError,
    NoopHooks, Transition,
};

/// Records which hooks ran and can be told to fail one of them.
#[derive(Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail: Option<&'static str>,
    seen_config: Option<ConfigMap>,
}

impl Recorder {
    fn failing(hook: &'static str) -> Self {
        Self {
            fail: Some(hook),
            ..Self::default()
        }
    }

    fn record(&self, hook: &'static str) -> anyhow::Result<()> {
        self.calls.lock().push(hook);
        if self.fail == Some(hook) {
            anyhow::bail!("{} refused", hook);
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleHooks for Recorder {
    async fn on_configure(&mut self, _node: &Node, config: &ConfigMap) -> anyhow::Result<()> {
        self.seen_config = Some(config.clone());
        self.record("on_configure")
    }

    async fn on_activate(&mut self, _node: &Node) -> anyhow::Result<()> {
        self.record("on_activate")
    }

    async fn on_deactivate(&mut self, _node: &Node) -> anyhow::Result<()> {
        self.record("on_deactivate")
    }

    async fn on_shutdown(&mut self, _node: &Node) -> anyhow::Result<()> {
        self.record("on_shutdown")
    }
}

fn config(value: Value) -> ConfigMap {
    match value {
        Value::Object(map) => map,
        other => panic!("config must be an object, got {}", other),
    }
}

#[tokio::test]
async fn test_activate_before_configure_is_rejected() {
    let (node, _daemon) = scripted_node("early");
    let managed = LifecycleNode::new(node, Recorder::default());

    let err = managed.activate().await.unwrap_err();
    assert!(matches!(
        err,
        NodeError::InvalidTransition {
            state: LifecycleState::Unconfigured,
            transition: Transition::Activate,
        }
    ));
    assert_eq!(managed.state(), LifecycleState::Unconfigured);
    assert!(managed.hooks().await.calls.lock().is_empty());
}

#[tokio::test]
async fn test_full_sequence_runs_each_hook_once_in_order() {
    let (node, daemon) = scripted_node("orderly");
    let managed = LifecycleNode::new(node, Recorder::default());
    let calls = managed.hooks().await.calls.clone();

    managed.node().connect().await.unwrap();
    managed.configure(ConfigMap::new()).await.unwrap();
    assert_eq!(managed.state(), LifecycleState::Inactive);
    managed.activate().await.unwrap();
    assert_eq!(managed.state(), LifecycleState::Active);
    managed.deactivate().await.unwrap();
    assert_eq!(managed.state(), LifecycleState::Inactive);
    managed.shutdown().await.unwrap();
    assert_eq!(managed.state(), LifecycleState::Finalized);

    assert_eq!(
        *calls.lock(),
        vec!["on_configure", "on_activate", "on_deactivate", "on_shutdown"]
    );
    assert!(!managed.node().is_connected());
    assert!(!daemon.is_connected());
}

#[tokio::test]
async fn test_finalized_rejects_every_transition() {
    let (node, _daemon) = scripted_node("done");
    let managed = LifecycleNode::new(node, NoopHooks);
    managed.shutdown().await.unwrap();

    for result in [
        managed.configure(ConfigMap::new()).await,
        managed.activate().await,
        managed.deactivate().await,
        managed.shutdown().await,
    ] {
        assert!(matches!(
            result,
            Err(NodeError::InvalidTransition {
                state: LifecycleState::Finalized,
                ..
            })
        ));
    }
    assert_eq!(managed.state(), LifecycleState::Finalized);
}

#[tokio::test]
async fn test_failing_configure_hook_aborts_transition() {
    let (node, _daemon) = scripted_node("broken");
    let managed = LifecycleNode::new(node, Recorder::failing("on_configure"));

    let err = managed
        .configure(config(json!({"api_key": "sk"})))
        .await
        .unwrap_err();

    match err {
        NodeError::Hook { hook, source } => {
            assert_eq!(hook, "on_configure");
            assert_eq!(source.to_string(), "on_configure refused");
        }
        other => panic!("expected hook error, got {:?}", other),
    }
    assert_eq!(managed.state(), LifecycleState::Unconfigured);
    assert!(managed.config().is_none());
}

#[tokio::test]
async fn test_failing_activate_hook_stays_inactive() {
    let (node, _daemon) = scripted_node("hesitant");
    let managed = LifecycleNode::new(node, Recorder::failing("on_activate"));
    managed.configure(ConfigMap::new()).await.unwrap();

    assert!(matches!(
        managed.activate().await,
        Err(NodeError::Hook {
            hook: "on_activate",
            ..
        })
    ));
    assert_eq!(managed.state(), LifecycleState::Inactive);
}

#[tokio::test]
async fn test_failing_deactivate_hook_stays_active() {
    let (node, _daemon) = scripted_node("stubborn");
    let managed = LifecycleNode::new(node, Recorder::failing("on_deactivate"));
    managed.bringup(ConfigMap::new()).await.unwrap();

    assert!(matches!(
        managed.deactivate().await,
        Err(NodeError::Hook {
            hook: "on_deactivate",
            ..
        })
    ));
    assert_eq!(managed.state(), LifecycleState::Active);
}

#[tokio::test]
async fn test_failing_shutdown_hook_keeps_connection() {
    let (node, daemon) = scripted_node("clingy");
    let managed = LifecycleNode::new(node, Recorder::failing("on_shutdown"));
    managed.node().connect().await.unwrap();
    managed.configure(ConfigMap::new()).await.unwrap();

    assert!(matches!(
        managed.shutdown().await,
        Err(NodeError::Hook {
            hook: "on_shutdown",
            ..
        })
    ));
    assert_eq!(managed.state(), LifecycleState::Inactive);
    assert!(managed.node().is_connected());
    assert!(daemon.is_connected());
}

#[tokio::test]
async fn test_shutdown_from_unconfigured() {
    let (node, _daemon) = scripted_node("quick_exit");
    let managed = LifecycleNode::new(node, Recorder::default());

    managed.shutdown().await.unwrap();
    assert_eq!(managed.state(), LifecycleState::Finalized);
    assert_eq!(*managed.hooks().await.calls.lock(), vec!["on_shutdown"]);
}

#[tokio::test]
async fn test_config_passed_through_unmodified() {
    let (node, _daemon) = scripted_node("configured");
    let managed = LifecycleNode::new(node, Recorder::default());
    let given = config(json!({
        "model": "gpt",
        "limits": {"tokens": 512},
        "tags": ["a", "b"],
    }));

    managed.configure(given.clone()).await.unwrap();

    assert_eq!(managed.config(), Some(given.clone()));
    assert_eq!(managed.hooks().await.seen_config, Some(given));
}

#[tokio::test]
async fn test_bringup_reaches_active() {
    let (node, daemon) = scripted_node("booted");
    let managed = LifecycleNode::new(node, Recorder::default());

    managed.bringup(ConfigMap::new()).await.unwrap();

    assert_eq!(managed.state(), LifecycleState::Active);
    assert!(managed.node().is_connected());
    assert_eq!(daemon.connect_count(), 1);
    assert_eq!(
        *managed.hooks().await.calls.lock(),
        vec!["on_configure", "on_activate"]
    );
}

#[tokio::test]
async fn test_bringup_stops_at_first_failure() {
    let (node, daemon) = scripted_node("unlucky");
    daemon.set_reachable(false);
    let managed = LifecycleNode::new(node, Recorder::default());

    let err = managed.bringup(ConfigMap::new()).await.unwrap_err();
    assert!(matches!(err, NodeError::Connection(_)));
    assert_eq!(managed.state(), LifecycleState::Unconfigured);
    assert!(managed.hooks().await.calls.lock().is_empty());

    daemon.set_reachable(true);
    let managed = LifecycleNode::new(managed.node().clone(), Recorder::failing("on_activate"));
    assert!(managed.bringup(ConfigMap::new()).await.is_err());
    assert_eq!(managed.state(), LifecycleState::Inactive);
}

#[tokio::test]
async fn test_gated_subscriber_only_runs_while_active() {
    let (node, daemon) = scripted_node("gated");
    let managed = LifecycleNode::new(node, NoopHooks);
    let inbox = Inbox::default();
    {
        let inbox = inbox.clone();
        managed.subscribe("/sensor", move |msg: Message| {
            let inbox = inbox.clone();
            async move {
                inbox.push(msg);
                anyhow::Ok(())
            }
        });
    }
    // Ungated registrations on the raw node always run.
    let raw = Inbox::default();
    raw.subscribe(managed.node(), "/sensor");

    managed.node().connect().await.unwrap();
    managed.configure(ConfigMap::new()).await.unwrap();

    let deliver = |n: i64| daemon.inject(Envelope::publish("/sensor", "src", json!(n)));

    deliver(1);
    managed.node().spin_once(WAIT).await.unwrap();
    assert_eq!(inbox.len(), 0);

    managed.activate().await.unwrap();
    deliver(2);
    managed.node().spin_once(WAIT).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox.messages()[0].payload, json!(2));

    managed.deactivate().await.unwrap();
    deliver(3);
    managed.node().spin_once(WAIT).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(raw.len(), 3);
}

#[tokio::test]
async fn test_gated_service_refuses_while_inactive() {
    let (node, _daemon) = loopback_node("worker");
    let managed = Arc::new(LifecycleNode::new(node, NoopHooks));
    managed
        .service("/work", |req: Value| async move { anyhow::Ok(json!({ "done": req })) })
        .unwrap();
    managed.node().connect().await.unwrap();
    managed.configure(ConfigMap::new()).await.unwrap();
    let (token, spin) = spawn_spin(managed.node());

    let err = managed
        .node()
        .call_service("/work", json!(1), WAIT)
        .await
        .unwrap_err();
    assert!(
        matches!(err, NodeError::Remote { ref message, .. } if message == "node 'worker' is not active")
    );

    managed.activate().await.unwrap();
    let answer = managed
        .node()
        .call_service("/work", json!(1), WAIT)
        .await
        .unwrap();
    assert_eq!(answer, json!({"done": 1}));

    token.cancel();
    spin.await.unwrap().unwrap();
}
