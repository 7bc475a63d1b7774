//! In-process transport
//!
//! Frames are encoded to JSON lines on send and decoded on receive, the same
//! framing a socket transport would use, so protocol mistakes surface here
//! too. The [`DaemonHandle`] half stands in for the Daemon: it injects
//! inbound frames and observes what the node sent.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tagentacle_protocol::Envelope;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::{Transport, TransportError};

#[derive(Debug)]
struct LinkState {
    reachable: bool,
    connected: bool,
    connects: usize,
}

#[derive(Debug)]
struct Link {
    state: Mutex<LinkState>,
    hangup: Notify,
}

impl Link {
    fn new() -> Self {
        Self {
            state: Mutex::new(LinkState {
                reachable: true,
                connected: false,
                connects: 0,
            }),
            hangup: Notify::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().connected
    }

    fn close(&self) {
        self.state.lock().connected = false;
        self.hangup.notify_waiters();
    }
}

/// Node side of an in-memory link
pub struct MemoryTransport {
    link: Arc<Link>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    loopback: bool,
}

/// Daemon side of an in-memory link
pub struct DaemonHandle {
    link: Arc<Link>,
    inbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MemoryTransport {
    /// A transport wired to a scripted Daemon.
    pub fn pair() -> (Self, DaemonHandle) {
        Self::build(false)
    }

    /// A transport whose data frames come straight back to the sending
    /// node, as if the Daemon routed everything to it.
    ///
    /// Publications reach the node's own subscribers and service calls
    /// reach its own handlers. Announcements (`subscribe`,
    /// `advertise_service`) still go to the returned [`DaemonHandle`].
    pub fn loopback() -> (Self, DaemonHandle) {
        Self::build(true)
    }

    fn build(loopback: bool) -> (Self, DaemonHandle) {
        let link = Arc::new(Link::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let transport = Self {
            link: link.clone(),
            inbound_tx: inbound_tx.clone(),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            loopback,
        };
        let daemon = DaemonHandle {
            link,
            inbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        };
        (transport, daemon)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if !state.reachable {
            return Err(TransportError::Unreachable(
                "in-memory daemon is not accepting connections".to_string(),
            ));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn send_frame(&self, frame: Envelope) -> Result<(), TransportError> {
        if !self.link.is_open() {
            return Err(TransportError::Closed);
        }
        let line = frame.to_json_line()?;
        let target = if self.loopback && !frame.is_control() {
            &self.inbound_tx
        } else {
            &self.outbound_tx
        };
        target.send(line).map_err(|_| TransportError::Closed)
    }

    async fn receive_frame(&self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        let hangup = self.link.hangup.notified();
        tokio::pin!(hangup);
        hangup.as_mut().enable();

        if !self.link.is_open() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = &mut hangup => Err(TransportError::Closed),
            received = tokio::time::timeout(timeout, rx.recv()) => match received {
                Err(_) => Ok(None),
                Ok(Some(line)) => Ok(Some(Envelope::from_json_line(&line)?)),
                Ok(None) => Err(TransportError::Closed),
            },
        }
    }

    async fn disconnect(&self) {
        debug!("Closing in-memory link");
        self.link.close();
    }
}

impl DaemonHandle {
    /// Deliver a frame to the node.
    pub fn inject(&self, frame: Envelope) {
        match frame.to_json_line() {
            Ok(line) => self.inject_raw(line),
            Err(e) => debug!("Dropping unencodable frame: {}", e),
        }
    }

    /// Deliver a raw line to the node, bypassing encoding.
    pub fn inject_raw(&self, line: impl Into<String>) {
        let _ = self.inbound_tx.send(line.into());
    }

    /// Wait up to `timeout` for the next frame the node sent.
    pub async fn next_outbound(&self, timeout: Duration) -> Option<Envelope> {
        let mut rx = self.outbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(line)) => Envelope::from_json_line(&line).ok(),
            _ => None,
        }
    }

    /// Everything the node sent that has not been read yet.
    pub async fn drain_outbound(&self) -> Vec<Envelope> {
        let mut rx = self.outbound_rx.lock().await;
        let mut frames = Vec::new();
        while let Ok(line) = rx.try_recv() {
            if let Ok(frame) = Envelope::from_json_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Make future connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.link.state.lock().reachable = reachable;
    }

    /// Hang up on the node as a crashed Daemon would.
    pub fn sever(&self) {
        self.link.close();
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    /// Number of successful `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.link.state.lock().connects
    }
}
