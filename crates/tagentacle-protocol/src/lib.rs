//! Frames exchanged between Tagentacle nodes and the Daemon.

mod envelope;

pub use envelope::{
    CorrelationId, Envelope, OP_ADVERTISE_SERVICE, OP_CALL_SERVICE, OP_PUBLISH,
    OP_SERVICE_RESPONSE, OP_SUBSCRIBE,
};
