//! Transport contract between a node and the Daemon
//!
//! The runtime never opens sockets itself. It drives an implementation of
//! [`Transport`], which owns the duplex channel and its framing. The crate
//! ships [`MemoryTransport`] for tests and in-process embedding.

mod memory;

pub use memory::{DaemonHandle, MemoryTransport};

use async_trait::async_trait;
use std::time::Duration;
use tagentacle_protocol::Envelope;
use thiserror::Error;

/// Failures of the underlying channel
#[derive(Debug, Error)]
pub enum TransportError {
    /// The Daemon did not accept the connection
    #[error("daemon unreachable: {0}")]
    Unreachable(String),

    /// The peer closed the channel
    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Duplex frame channel to the Daemon.
///
/// All methods take `&self`: the dispatch loop sits in
/// [`receive_frame`](Transport::receive_frame) while other tasks send
/// requests and responses through the same transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. Called again after a disconnect to reconnect.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn send_frame(&self, frame: Envelope) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next inbound frame.
    ///
    /// Returns `Ok(None)` when nothing arrived in time and
    /// `Err(TransportError::Closed)` once the peer has hung up. Must be
    /// cancel-safe: dropping the future must not lose a frame.
    async fn receive_frame(&self, timeout: Duration) -> Result<Option<Envelope>, TransportError>;

    /// Close the channel. Must tolerate being called when not connected.
    async fn disconnect(&self);
}
