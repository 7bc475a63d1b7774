//! Error types for the node runtime

use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::{LifecycleState, Transition};
use crate::transport::TransportError;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors surfaced by [`Node`](crate::Node) and
/// [`LifecycleNode`](crate::LifecycleNode) operations.
///
/// Errors raised by subscription callbacks and service handlers while the
/// dispatch loop runs never show up here; the loop logs them and, for
/// service handlers, sends them back to the caller as an error response,
/// which the caller then sees as [`NodeError::Remote`].
#[derive(Debug, Error)]
pub enum NodeError {
    /// The Daemon could not be reached or the connection dropped
    #[error("connection error: {0}")]
    Connection(#[from] TransportError),

    /// Operation requires a connected node
    #[error("node '{node_id}' is not connected")]
    NotConnected { node_id: String },

    /// No response arrived before the call's deadline
    #[error("service call '{service}' timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    /// The call was abandoned by disconnect or explicit cancellation
    #[error("service call '{service}' was cancelled")]
    Cancelled { service: String },

    /// The remote side answered with an error response
    #[error("service '{service}' failed: {message}")]
    Remote { service: String, message: String },

    /// A handler is already registered under this service name
    #[error("service '{0}' already has a handler")]
    DuplicateService(String),

    /// Lifecycle transition requested from a state that does not allow it
    #[error("cannot {transition} from state {state}")]
    InvalidTransition {
        state: LifecycleState,
        transition: Transition,
    },

    /// A lifecycle hook failed; the transition was aborted
    #[error("{hook} failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl NodeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
