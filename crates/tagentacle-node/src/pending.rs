//! In-flight service calls awaiting a response
//!
//! Every entry owns the sending half of a oneshot channel. Whoever removes
//! the entry from the table resolves the call, which is what makes the
//! first resolution win: a late response, a sweep, a disconnect and the
//! caller's own deadline all race to remove the same key and only one of
//! them finds it.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tagentacle_protocol::CorrelationId;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{NodeError, Result};

pub(crate) type CallOutcome = Result<Value>;

struct PendingCall {
    service: String,
    timeout: Duration,
    deadline: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

/// Details of a call that was just registered.
pub(crate) struct Registered {
    pub id: CorrelationId,
    pub deadline: Instant,
    pub outcome: oneshot::Receiver<CallOutcome>,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl PendingCalls {
    /// Create a pending call with a fresh correlation id.
    pub(crate) fn register(&self, service: &str, timeout: Duration) -> Registered {
        let (slot, outcome) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let mut calls = self.calls.lock();
        let mut id = CorrelationId::new();
        while calls.contains_key(&id) {
            id = CorrelationId::new();
        }
        calls.insert(
            id.clone(),
            PendingCall {
                service: service.to_string(),
                timeout,
                deadline,
                slot,
            },
        );
        Registered {
            id,
            deadline,
            outcome,
        }
    }

    /// Resolve a call with a response. Returns the service name, or `None`
    /// if no such call is pending (unknown, late or duplicate response).
    pub(crate) fn resolve(&self, id: &CorrelationId, outcome: CallOutcome) -> Option<String> {
        let call = self.calls.lock().remove(id)?;
        let _ = call.slot.send(outcome);
        Some(call.service)
    }

    /// Resolve one call as timed out, if it is still pending.
    pub(crate) fn expire(&self, id: &CorrelationId) -> bool {
        let Some(call) = self.calls.lock().remove(id) else {
            return false;
        };
        let err = NodeError::Timeout {
            service: call.service,
            timeout: call.timeout,
        };
        let _ = call.slot.send(Err(err));
        true
    }

    /// Resolve one call as cancelled, if it is still pending.
    pub(crate) fn cancel(&self, id: &CorrelationId) -> bool {
        let Some(call) = self.calls.lock().remove(id) else {
            return false;
        };
        let _ = call.slot.send(Err(NodeError::Cancelled {
            service: call.service,
        }));
        true
    }

    /// Resolve every call whose deadline is at or before `now` as timed
    /// out. Returns the affected service names.
    pub(crate) fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let expired: Vec<PendingCall> = {
            let mut calls = self.calls.lock();
            let ids: Vec<CorrelationId> = calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };

        expired
            .into_iter()
            .map(|call| {
                let service = call.service.clone();
                let _ = call.slot.send(Err(NodeError::Timeout {
                    service: call.service,
                    timeout: call.timeout,
                }));
                service
            })
            .collect()
    }

    /// Resolve every pending call as cancelled. Returns how many there were.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<PendingCall> = self.calls.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.slot.send(Err(NodeError::Cancelled {
                service: call.service,
            }));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &CorrelationId) -> bool {
        self.calls.lock().contains_key(id)
    }
}
