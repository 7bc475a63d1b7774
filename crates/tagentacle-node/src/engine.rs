//! Dispatch engine
//!
//! Owns the transport, the registries and the pending-call table, and runs
//! the receive loop that routes inbound frames:
//!
//! - `publish` frames go to every subscriber of the topic, one after
//!   another in registration order
//! - `call_service` frames go to the named handler on a task of their own
//! - `service_response` frames resolve the matching pending call
//!
//! Each loop iteration also times out expired calls, so a call whose
//! deadline has passed is resolved even if no traffic arrives.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tagentacle_config::{NodeConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_POLL_INTERVAL};
use tagentacle_protocol::{CorrelationId, Envelope};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{NodeError, Result};
use crate::handler::{Message, ServiceHandler, Subscriber};
use crate::pending::{CallOutcome, PendingCalls};
use crate::registry::{
    ServiceHandle, ServiceRegistry, SubscriptionHandle, SubscriptionRegistry,
};
use crate::transport::{Transport, TransportError};

/// Timing knobs of the dispatch engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Deadline used by `call_service` when the caller gives none
    pub call_timeout: Duration,
    /// Longest wait for an inbound frame before the loop checks for
    /// cancellation and expired calls again
    pub poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&NodeConfig> for EngineOptions {
    fn from(config: &NodeConfig) -> Self {
        Self {
            call_timeout: config.call_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

pub(crate) struct DispatchEngine {
    node_id: String,
    transport: Arc<dyn Transport>,
    options: EngineOptions,
    connected: AtomicBool,
    subscriptions: SubscriptionRegistry,
    services: ServiceRegistry,
    pending: PendingCalls,
    /// Control frames waiting for the next send or loop iteration
    announcements: Mutex<VecDeque<Envelope>>,
    /// Feeds the delivery worker, started on the first publication
    deliveries: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
}

/// A publication queued for the delivery worker, with an acknowledgement
/// fired once every subscriber has seen it.
type Delivery = (Message, oneshot::Sender<()>);

impl DispatchEngine {
    pub(crate) fn new(
        node_id: String,
        transport: Arc<dyn Transport>,
        options: EngineOptions,
    ) -> Self {
        Self {
            node_id,
            transport,
            options,
            connected: AtomicBool::new(false),
            subscriptions: SubscriptionRegistry::default(),
            services: ServiceRegistry::default(),
            pending: PendingCalls::default(),
            announcements: Mutex::new(VecDeque::new()),
            deliveries: Mutex::new(None),
        }
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn options(&self) -> EngineOptions {
        self.options
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(NodeError::NotConnected {
                node_id: self.node_id.clone(),
            })
        }
    }

    // --- connection ---

    /// Open the transport and announce every registered topic and service.
    /// A no-op when already connected.
    pub(crate) async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("Node '{}' already connected", self.node_id);
            return Ok(());
        }

        self.transport.connect().await?;
        {
            let mut queue = self.announcements.lock();
            queue.clear();
            for topic in self.subscriptions.topics() {
                queue.push_back(Envelope::subscribe(topic, &self.node_id));
            }
            for service in self.services.names() {
                queue.push_back(Envelope::advertise_service(service, &self.node_id));
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("Node '{}' connected to daemon", self.node_id);

        self.flush_announcements().await
    }

    /// Close the transport and cancel every pending call. Registries are
    /// kept so a later `connect` restores the node's subscriptions.
    pub(crate) async fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.announcements.lock().clear();
        let cancelled = self.pending.cancel_all();
        self.transport.disconnect().await;

        if was_connected {
            info!(
                "Node '{}' disconnected ({} pending call(s) cancelled)",
                self.node_id, cancelled
            );
        }
    }

    /// Tear the connection down after a transport failure.
    async fn fail_connection(&self, err: &TransportError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Node '{}' lost its connection: {}", self.node_id, err);
        }
        self.announcements.lock().clear();
        self.pending.cancel_all();
        self.transport.disconnect().await;
    }

    async fn flush_announcements(&self) -> Result<()> {
        let queued: Vec<Envelope> = self.announcements.lock().drain(..).collect();
        for frame in queued {
            debug!("Announcing {} to daemon", frame.op());
            if let Err(e) = self.transport.send_frame(frame).await {
                self.fail_connection(&e).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn send(&self, frame: Envelope) -> Result<()> {
        self.flush_announcements().await?;
        if let Err(e) = self.transport.send_frame(frame).await {
            self.fail_connection(&e).await;
            return Err(e.into());
        }
        Ok(())
    }

    // --- registration ---

    pub(crate) fn register_subscription(
        &self,
        topic: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriptionHandle {
        let (handle, first) = self.subscriptions.insert(topic, subscriber);
        debug!("Subscribed {} to '{}'", handle.id(), topic);
        if first && self.is_connected() {
            self.announcements
                .lock()
                .push_back(Envelope::subscribe(topic, &self.node_id));
        }
        handle
    }

    pub(crate) fn unregister_subscription(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.subscriptions.remove(handle);
        if removed {
            debug!("Removed {} from '{}'", handle.id(), handle.topic());
        }
        removed
    }

    pub(crate) fn register_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<ServiceHandle> {
        let handle = self.services.insert(name, handler)?;
        debug!("Registered service '{}'", name);
        if self.is_connected() {
            self.announcements
                .lock()
                .push_back(Envelope::advertise_service(name, &self.node_id));
        }
        Ok(handle)
    }

    // --- outbound ---

    pub(crate) async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.ensure_connected()?;
        self.send(Envelope::publish(topic, &self.node_id, payload))
            .await
    }

    /// Send a request and wait for its response, the deadline, or
    /// cancellation, whichever comes first.
    pub(crate) async fn call_service(
        &self,
        service: &str,
        payload: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        self.ensure_connected()?;

        let call = self.pending.register(service, timeout);
        let id = call.id;
        let mut outcome = call.outcome;
        debug!("Calling '{}' as {}", service, id);

        let request = Envelope::service_request(service, id.clone(), payload, &self.node_id);
        if let Err(e) = self.send(request).await {
            self.pending.cancel(&id);
            return Err(e);
        }

        let cancel = cancel.cloned().unwrap_or_default();
        tokio::select! {
            biased;
            received = &mut outcome => return settle(service, received),
            _ = tokio::time::sleep_until(call.deadline) => {
                if self.pending.expire(&id) {
                    warn!("Call to '{}' timed out after {:?}", service, timeout);
                }
            }
            _ = cancel.cancelled() => {
                if self.pending.cancel(&id) {
                    debug!("Call to '{}' cancelled by caller", service);
                }
            }
        }

        // Whoever removed the entry has already filled the slot.
        settle(service, outcome.await)
    }

    // --- inbound ---

    /// Run one loop iteration: flush announcements, wait up to `wait` for
    /// a frame, route it, then time out expired calls. Returns whether a
    /// frame was routed.
    ///
    /// A publication is fully delivered before this returns.
    pub(crate) async fn dispatch_once(self: &Arc<Self>, wait: Duration) -> Result<bool> {
        self.ensure_connected()?;
        self.flush_announcements().await?;

        let received = self.transport.receive_frame(wait).await;
        let routed = self.handle_received(received, true).await;
        self.sweep_expired();
        routed
    }

    /// Dispatch until `token` fires or the connection ends.
    ///
    /// Returns `Ok` on cancellation, local disconnect, or peer hang-up,
    /// and `Err(Connection)` on any other transport failure.
    pub(crate) async fn run(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        self.ensure_connected()?;
        info!("Node '{}' spinning", self.node_id);

        loop {
            if token.is_cancelled() {
                debug!("Spin of '{}' cancelled", self.node_id);
                return Ok(());
            }
            if !self.is_connected() {
                debug!("Spin of '{}' ended by disconnect", self.node_id);
                return Ok(());
            }

            if let Err(e) = self.flush_announcements().await {
                return self.end_spin(e);
            }

            let received = tokio::select! {
                biased;
                _ = token.cancelled() => continue,
                received = self.transport.receive_frame(self.options.poll_interval) => received,
            };

            if let Err(e) = self.handle_received(received, false).await {
                return self.end_spin(e);
            }

            self.sweep_expired();
            tokio::task::yield_now().await;
        }
    }

    /// A peer hang-up ends the spin cleanly; anything else is returned.
    fn end_spin(&self, error: NodeError) -> Result<()> {
        match error {
            NodeError::Connection(TransportError::Closed) => {
                info!("Daemon closed the connection of '{}'", self.node_id);
                Ok(())
            }
            e => Err(e),
        }
    }

    async fn handle_received(
        self: &Arc<Self>,
        received: std::result::Result<Option<Envelope>, TransportError>,
        await_delivery: bool,
    ) -> Result<bool> {
        match received {
            Ok(Some(frame)) => {
                self.route(frame, await_delivery).await;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(TransportError::Codec(e)) => {
                warn!("Skipping undecodable frame: {}", e);
                Ok(false)
            }
            Err(e) => {
                if !self.is_connected() {
                    // Local disconnect while the receive was in flight.
                    return Ok(false);
                }
                self.fail_connection(&e).await;
                Err(e.into())
            }
        }
    }

    async fn route(self: &Arc<Self>, frame: Envelope, await_delivery: bool) {
        match frame {
            Envelope::Publish {
                topic,
                sender,
                payload,
            } => {
                let delivered = self.enqueue_delivery(Message {
                    topic,
                    sender,
                    payload,
                });
                if await_delivery {
                    // Err only if the worker died mid-delivery.
                    let _ = delivered.await;
                }
            }
            Envelope::ServiceRequest {
                service,
                request_id,
                payload,
                caller_id,
            } => self.serve(service, request_id, payload, caller_id).await,
            Envelope::ServiceResponse {
                service,
                request_id,
                payload,
                error,
                ..
            } => {
                let outcome = match error {
                    Some(message) => Err(NodeError::Remote {
                        service: service.clone(),
                        message,
                    }),
                    None => Ok(payload),
                };
                if self.pending.resolve(&request_id, outcome).is_none() {
                    warn!(
                        "Discarding response from '{}' for unknown or settled call {}",
                        service, request_id
                    );
                }
            }
            control @ (Envelope::Subscribe { .. } | Envelope::AdvertiseService { .. }) => {
                debug!("Ignoring inbound {} frame", control.op());
            }
        }
    }

    /// Hand a publication to the delivery worker, starting it if needed.
    ///
    /// A single worker per node keeps publications in arrival order while
    /// the dispatch loop goes on reading frames, so a subscriber can wait on
    /// a service response.
    fn enqueue_delivery(self: &Arc<Self>, message: Message) -> oneshot::Receiver<()> {
        let (done, delivered) = oneshot::channel();
        let mut worker = self.deliveries.lock();
        let item = match worker.as_ref() {
            Some(tx) => match tx.send((message, done)) {
                Ok(()) => return delivered,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => (message, done),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive until the worker below drops it.
        let _ = tx.send(item);
        *worker = Some(tx);
        drop(worker);

        tokio::spawn(Self::delivery_worker(Arc::downgrade(self), rx).in_current_span());
        delivered
    }

    async fn delivery_worker(engine: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some((message, done)) = rx.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.deliver(message).await;
            let _ = done.send(());
        }
    }

    async fn deliver(&self, message: Message) {
        let subscribers = self.subscriptions.subscribers(&message.topic);
        if subscribers.is_empty() {
            debug!("No subscribers for '{}'", message.topic);
            return;
        }

        for subscriber in subscribers {
            let delivery = AssertUnwindSafe(subscriber.on_message(message.clone()));
            match delivery.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Subscriber on '{}' failed: {:#}", message.topic, e),
                Err(panic) => warn!(
                    "Subscriber on '{}' panicked: {}",
                    message.topic,
                    panic_message(panic.as_ref())
                ),
            }
        }
    }

    async fn serve(
        self: &Arc<Self>,
        service: String,
        request_id: CorrelationId,
        payload: Value,
        caller_id: String,
    ) {
        let Some(handler) = self.services.get(&service) else {
            warn!("Request {} from '{}' for unknown service '{}'", request_id, caller_id, service);
            let message = format!("service not found: {}", service);
            let response = Envelope::service_error(service, request_id, message, caller_id);
            if let Err(e) = self.send(response).await {
                warn!("Failed to send error response: {}", e);
            }
            return;
        };

        let engine = Arc::clone(self);
        let task = async move {
            let result = AssertUnwindSafe(handler.handle(payload)).catch_unwind().await;
            let response = match result {
                Ok(Ok(value)) => Envelope::service_success(&service, request_id, value, caller_id),
                Ok(Err(e)) => {
                    error!("Service '{}' failed: {:#}", service, e);
                    Envelope::service_error(&service, request_id, format!("{:#}", e), caller_id)
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!("Service '{}' panicked: {}", service, reason);
                    Envelope::service_error(
                        &service,
                        request_id,
                        format!("handler panicked: {}", reason),
                        caller_id,
                    )
                }
            };
            if let Err(e) = engine.send(response).await {
                warn!("Failed to send response for '{}': {}", service, e);
            }
        };
        tokio::spawn(task.in_current_span());
    }

    fn sweep_expired(&self) {
        for service in self.pending.sweep_expired(Instant::now()) {
            warn!("Call to '{}' timed out", service);
        }
    }
}

fn settle(
    service: &str,
    received: std::result::Result<CallOutcome, tokio::sync::oneshot::error::RecvError>,
) -> Result<Value> {
    received.unwrap_or_else(|_| {
        Err(NodeError::Cancelled {
            service: service.to_string(),
        })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
