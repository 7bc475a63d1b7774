//! Subscription and service registries
//!
//! Both registries sit behind `parking_lot` locks so `subscribe`/`service`
//! can be called from any task while the dispatch loop is running. The
//! loop clones the callbacks it needs out of the registry and releases the
//! lock before invoking them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{NodeError, Result};
use crate::handler::{ServiceHandler, Subscriber};

/// Counter for generating unique subscription IDs.
static SUBSCRIPTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one registered subscription.
///
/// Unique within the process, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(SUBSCRIPTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Returned by `subscribe`; pass it to `unsubscribe` to remove the callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: String,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// Returned by `service` on successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    name: String,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct SubscriptionEntry {
    id: SubscriptionId,
    subscriber: Arc<dyn Subscriber>,
}

/// Topic → callbacks, in registration order.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: RwLock<HashMap<String, Vec<SubscriptionEntry>>>,
}

impl SubscriptionRegistry {
    /// Add a callback. The flag is true when this is the topic's first
    /// subscription (the Daemon has not been told about it yet).
    pub(crate) fn insert(
        &self,
        topic: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> (SubscriptionHandle, bool) {
        let id = SubscriptionId::next();
        let mut topics = self.topics.write();
        let entries = topics.entry(topic.to_string()).or_default();
        let first = entries.is_empty();
        entries.push(SubscriptionEntry { id, subscriber });
        (
            SubscriptionHandle {
                topic: topic.to_string(),
                id,
            },
            first,
        )
    }

    pub(crate) fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let mut topics = self.topics.write();
        let Some(entries) = topics.get_mut(&handle.topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != handle.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            topics.remove(&handle.topic);
        }
        removed
    }

    /// Callbacks for `topic`, in registration order.
    pub(crate) fn subscribers(&self, topic: &str) -> Vec<Arc<dyn Subscriber>> {
        self.topics
            .read()
            .get(topic)
            .map(|entries| entries.iter().map(|e| e.subscriber.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(Vec::len).unwrap_or(0)
    }
}

/// Service name → its single handler.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl ServiceRegistry {
    /// Register a handler. A second registration under the same name is
    /// rejected and leaves the first handler in place.
    pub(crate) fn insert(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<ServiceHandle> {
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(NodeError::DuplicateService(name.to_string()));
        }
        services.insert(name.to_string(), handler);
        Ok(ServiceHandle {
            name: name.to_string(),
        })
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services.read().get(name).cloned()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Message;
    use serde_json::Value;

    fn noop_subscriber() -> Arc<dyn Subscriber> {
        Arc::new(|_msg: Message| async { anyhow::Ok(()) })
    }

    fn echo_handler() -> Arc<dyn ServiceHandler> {
        Arc::new(|req: Value| async move { anyhow::Ok(req) })
    }

    #[test]
    fn test_subscription_ids_unique() {
        let registry = SubscriptionRegistry::default();
        let (a, first_a) = registry.insert("/t", noop_subscriber());
        let (b, first_b) = registry.insert("/t", noop_subscriber());

        assert_ne!(a.id(), b.id());
        assert!(a.id().as_u64() < b.id().as_u64());
        assert!(first_a);
        assert!(!first_b);
        assert_eq!(registry.count("/t"), 2);
    }

    #[test]
    fn test_remove_only_named_subscription() {
        let registry = SubscriptionRegistry::default();
        let (a, _) = registry.insert("/t", noop_subscriber());
        let (_b, _) = registry.insert("/t", noop_subscriber());

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_eq!(registry.count("/t"), 1);
    }

    #[test]
    fn test_empty_topic_is_dropped() {
        let registry = SubscriptionRegistry::default();
        let (a, _) = registry.insert("/t", noop_subscriber());
        registry.remove(&a);
        assert!(registry.topics().is_empty());
        assert!(registry.subscribers("/t").is_empty());

        let (_, first) = registry.insert("/t", noop_subscriber());
        assert!(first);
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let registry = ServiceRegistry::default();
        let handle = registry.insert("/echo", echo_handler()).unwrap();
        assert_eq!(handle.name(), "/echo");

        let err = registry.insert("/echo", echo_handler()).unwrap_err();
        assert!(matches!(err, NodeError::DuplicateService(name) if name == "/echo"));
        assert_eq!(registry.names(), vec!["/echo".to_string()]);
    }

    #[test]
    fn test_unknown_service_lookup() {
        let registry = ServiceRegistry::default();
        assert!(registry.get("/missing").is_none());
    }

    #[test]
    fn test_subscription_display() {
        let registry = SubscriptionRegistry::default();
        let (handle, _) = registry.insert("/t", noop_subscriber());
        assert!(handle.id().to_string().starts_with("sub-"));
        assert_eq!(handle.topic(), "/t");
    }
}
