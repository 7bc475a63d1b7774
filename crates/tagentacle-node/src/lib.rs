//! # Tagentacle node runtime
//!
//! Client side of the Tagentacle message bus. A [`Node`] connects to the
//! Daemon through a [`Transport`] and then:
//!
//! - publishes to topics and delivers incoming publications to
//!   subscribers, in registration order
//! - answers service requests with registered handlers
//! - calls services on other nodes, with a deadline and optional
//!   cancellation
//!
//! Nothing happens on the inbound side unless the node is spinning:
//! [`Node::spin`] runs the dispatch loop until a [`CancellationToken`]
//! fires or the connection ends.
//!
//! [`LifecycleNode`] adds a managed state machine on top, with user hooks
//! for each transition and callbacks that only run while the node is
//! active.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

mod engine;
mod error;
mod handler;
mod lifecycle;
mod node;
mod pending;
mod registry;
pub mod transport;

pub use engine::EngineOptions;
pub use error::{NodeError, Result};
pub use handler::{Message, ServiceHandler, Subscriber};
pub use lifecycle::{
    ActivationGate, ConfigMap, LifecycleHooks, LifecycleNode, LifecycleState, NoopHooks,
    Transition,
};
pub use node::Node;
pub use registry::{ServiceHandle, SubscriptionHandle, SubscriptionId};
pub use transport::{DaemonHandle, MemoryTransport, Transport, TransportError};

pub use tagentacle_protocol::{CorrelationId, Envelope};
