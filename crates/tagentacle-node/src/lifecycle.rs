//! Managed node lifecycle
//!
//! A [`LifecycleNode`] wraps a [`Node`] in a four-state machine:
//!
//! ```text
//!                configure           activate
//! Unconfigured ───────────▶ Inactive ─────────▶ Active
//!      │                     │  ▲                 │
//!      │                     │  └── deactivate ───┘
//!      │ shutdown            │ shutdown           │ shutdown
//!      ▼                     ▼                    ▼
//!                        Finalized
//! ```
//!
//! Each transition runs the matching [`LifecycleHooks`] method first and
//! only changes state if the hook succeeds. Callbacks registered through
//! [`LifecycleNode::subscribe`] and [`LifecycleNode::service`] are gated:
//! they only run while the node is `Active`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{NodeError, Result};
use crate::handler::{Message, ServiceHandler, Subscriber};
use crate::node::Node;
use crate::registry::{ServiceHandle, SubscriptionHandle};

/// Configuration handed to [`LifecycleHooks::on_configure`], passed through
/// untouched.
pub type ConfigMap = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unconfigured,
    Inactive,
    Active,
    /// Terminal
    Finalized,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Finalized => "finalized",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unconfigured,
            1 => Self::Inactive,
            2 => Self::Active,
            _ => Self::Finalized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unconfigured => 0,
            Self::Inactive => 1,
            Self::Active => 2,
            Self::Finalized => 3,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Configure,
    Activate,
    Deactivate,
    Shutdown,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Shutdown => "shutdown",
        }
    }

    /// Name of the hook this transition runs.
    pub fn hook(&self) -> &'static str {
        match self {
            Self::Configure => "on_configure",
            Self::Activate => "on_activate",
            Self::Deactivate => "on_deactivate",
            Self::Shutdown => "on_shutdown",
        }
    }

    /// State reached when this transition is taken from `from`, or `None`
    /// if `from` does not allow it.
    pub fn target(&self, from: LifecycleState) -> Option<LifecycleState> {
        use LifecycleState::*;
        match (self, from) {
            (Self::Configure, Unconfigured) => Some(Inactive),
            (Self::Activate, Inactive) => Some(Active),
            (Self::Deactivate, Active) => Some(Inactive),
            (Self::Shutdown, Unconfigured | Inactive | Active) => Some(Finalized),
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User code run on lifecycle transitions.
///
/// Every hook defaults to doing nothing. Returning an error aborts the
/// transition: the state stays where it was and the caller receives
/// [`NodeError::Hook`].
///
/// ```
/// use async_trait::async_trait;
/// use tagentacle_node::{ConfigMap, LifecycleHooks, Node};
///
/// #[derive(Default)]
/// struct Greeter {
///     greeting: String,
/// }
///
/// #[async_trait]
/// impl LifecycleHooks for Greeter {
///     async fn on_configure(&mut self, _node: &Node, config: &ConfigMap) -> anyhow::Result<()> {
///         self.greeting = config
///             .get("greeting")
///             .and_then(|v| v.as_str())
///             .ok_or_else(|| anyhow::anyhow!("greeting is required"))?
///             .to_string();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait LifecycleHooks: Send {
    async fn on_configure(&mut self, _node: &Node, _config: &ConfigMap) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_activate(&mut self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_deactivate(&mut self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown(&mut self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// Shared view of a lifecycle node's state, checked by gated callbacks.
#[derive(Debug, Clone)]
pub struct ActivationGate {
    state: Arc<AtomicU8>,
}

impl ActivationGate {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LifecycleState::Unconfigured.as_u8())),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    fn set(&self, state: LifecycleState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Wraps a callback so it only runs while the gate is open.
struct Gated<T> {
    gate: ActivationGate,
    node_id: String,
    inner: T,
}

#[async_trait]
impl<S: Subscriber> Subscriber for Gated<S> {
    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        if !self.gate.is_active() {
            debug!(
                "Node '{}' is {}, skipping message on '{}'",
                self.node_id,
                self.gate.state(),
                message.topic
            );
            return Ok(());
        }
        self.inner.on_message(message).await
    }
}

#[async_trait]
impl<H: ServiceHandler> ServiceHandler for Gated<H> {
    async fn handle(&self, request: Value) -> anyhow::Result<Value> {
        if !self.gate.is_active() {
            anyhow::bail!("node '{}' is not active", self.node_id);
        }
        self.inner.handle(request).await
    }
}

/// A [`Node`] driven through configure/activate/deactivate/shutdown.
pub struct LifecycleNode<H: LifecycleHooks = NoopHooks> {
    node: Node,
    gate: ActivationGate,
    // Held for the whole of a transition, so transitions never interleave.
    hooks: tokio::sync::Mutex<H>,
    config: Mutex<Option<ConfigMap>>,
}

impl<H: LifecycleHooks> LifecycleNode<H> {
    pub fn new(node: Node, hooks: H) -> Self {
        Self {
            node,
            gate: ActivationGate::new(),
            hooks: tokio::sync::Mutex::new(hooks),
            config: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn state(&self) -> LifecycleState {
        self.gate.state()
    }

    pub fn gate(&self) -> ActivationGate {
        self.gate.clone()
    }

    /// Configuration stored by the last successful `configure`.
    pub fn config(&self) -> Option<ConfigMap> {
        self.config.lock().clone()
    }

    /// Exclusive access to the hooks value. Waits for any running
    /// transition to finish.
    pub async fn hooks(&self) -> MutexGuard<'_, H> {
        self.hooks.lock().await
    }

    /// Unconfigured → Inactive, running `on_configure` with `config`.
    pub async fn configure(&self, config: ConfigMap) -> Result<()> {
        let mut hooks = self.hooks.lock().await;
        let target = self.check(Transition::Configure)?;
        let outcome = hooks.on_configure(&self.node, &config).await;
        self.hook_result(Transition::Configure, outcome)?;
        *self.config.lock() = Some(config);
        self.enter(target);
        Ok(())
    }

    /// Inactive → Active. Gated callbacks start running.
    pub async fn activate(&self) -> Result<()> {
        let mut hooks = self.hooks.lock().await;
        let target = self.check(Transition::Activate)?;
        let outcome = hooks.on_activate(&self.node).await;
        self.hook_result(Transition::Activate, outcome)?;
        self.enter(target);
        Ok(())
    }

    /// Active → Inactive. Gated callbacks stop running.
    pub async fn deactivate(&self) -> Result<()> {
        let mut hooks = self.hooks.lock().await;
        let target = self.check(Transition::Deactivate)?;
        let outcome = hooks.on_deactivate(&self.node).await;
        self.hook_result(Transition::Deactivate, outcome)?;
        self.enter(target);
        Ok(())
    }

    /// Any non-final state → Finalized: runs `on_shutdown`, then
    /// disconnects the node.
    pub async fn shutdown(&self) -> Result<()> {
        let mut hooks = self.hooks.lock().await;
        let target = self.check(Transition::Shutdown)?;
        let outcome = hooks.on_shutdown(&self.node).await;
        self.hook_result(Transition::Shutdown, outcome)?;
        self.node.disconnect().await;
        self.enter(target);
        Ok(())
    }

    /// Connect, configure and activate, stopping at the first failure.
    pub async fn bringup(&self, config: ConfigMap) -> Result<()> {
        self.node.connect().await?;
        self.configure(config).await?;
        self.activate().await
    }

    /// Subscribe with a callback that only runs while the node is active.
    pub fn subscribe<S>(&self, topic: &str, subscriber: S) -> SubscriptionHandle
    where
        S: Subscriber + 'static,
    {
        self.node.subscribe(topic, self.gated(subscriber))
    }

    /// Register a service that answers with an error while the node is not
    /// active.
    pub fn service<S>(&self, name: &str, handler: S) -> Result<ServiceHandle>
    where
        S: ServiceHandler + 'static,
    {
        self.node.service(name, self.gated(handler))
    }

    pub async fn spin(&self, token: &CancellationToken) -> Result<()> {
        self.node.spin(token).await
    }

    fn gated<T>(&self, inner: T) -> Gated<T> {
        Gated {
            gate: self.gate.clone(),
            node_id: self.node.node_id().to_string(),
            inner,
        }
    }

    fn check(&self, transition: Transition) -> Result<LifecycleState> {
        let state = self.state();
        transition
            .target(state)
            .ok_or(NodeError::InvalidTransition { state, transition })
    }

    fn hook_result(&self, transition: Transition, outcome: anyhow::Result<()>) -> Result<()> {
        outcome.map_err(|source| {
            error!(
                "Node '{}': {} failed, staying {}: {:#}",
                self.node.node_id(),
                transition.hook(),
                self.state(),
                source
            );
            NodeError::Hook {
                hook: transition.hook(),
                source,
            }
        })
    }

    fn enter(&self, target: LifecycleState) {
        let from = self.state();
        self.gate.set(target);
        info!("Node '{}': {} -> {}", self.node.node_id(), from, target);
    }
}

impl<H: LifecycleHooks> fmt::Debug for LifecycleNode<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleNode")
            .field("node", &self.node)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    #[test]
    fn test_transition_table() {
        assert_eq!(Transition::Configure.target(Unconfigured), Some(Inactive));
        assert_eq!(Transition::Activate.target(Inactive), Some(Active));
        assert_eq!(Transition::Deactivate.target(Active), Some(Inactive));
        assert_eq!(Transition::Shutdown.target(Unconfigured), Some(Finalized));
        assert_eq!(Transition::Shutdown.target(Inactive), Some(Finalized));
        assert_eq!(Transition::Shutdown.target(Active), Some(Finalized));

        assert_eq!(Transition::Activate.target(Unconfigured), None);
        assert_eq!(Transition::Configure.target(Inactive), None);
        assert_eq!(Transition::Deactivate.target(Inactive), None);
    }

    #[test]
    fn test_finalized_is_terminal() {
        for transition in [
            Transition::Configure,
            Transition::Activate,
            Transition::Deactivate,
            Transition::Shutdown,
        ] {
            assert_eq!(transition.target(Finalized), None, "{}", transition);
        }
    }

    #[test]
    fn test_state_encoding() {
        for state in [Unconfigured, Inactive, Active, Finalized] {
            assert_eq!(LifecycleState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_gate_follows_state() {
        let gate = ActivationGate::new();
        assert_eq!(gate.state(), Unconfigured);
        assert!(!gate.is_active());

        let view = gate.clone();
        gate.set(Active);
        assert!(view.is_active());
        gate.set(Inactive);
        assert!(!view.is_active());
    }

    #[tokio::test]
    async fn test_gated_handler_refuses_while_inactive() {
        let gate = ActivationGate::new();
        let gated = Gated {
            gate: gate.clone(),
            node_id: "worker".to_string(),
            inner: |req: Value| async move { anyhow::Ok(req) },
        };

        let err = gated.handle(Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "node 'worker' is not active");

        gate.set(Active);
        assert_eq!(gated.handle(Value::from(3)).await.unwrap(), Value::from(3));
    }
}
