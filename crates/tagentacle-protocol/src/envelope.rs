use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Token linking a `call_service` frame to its `service_response`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Draw a fresh random id (UUID v4).
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const OP_PUBLISH: &str = "publish";
pub const OP_CALL_SERVICE: &str = "call_service";
pub const OP_SERVICE_RESPONSE: &str = "service_response";
pub const OP_SUBSCRIBE: &str = "subscribe";
pub const OP_ADVERTISE_SERVICE: &str = "advertise_service";

/// A single frame on the bus.
///
/// Serialized as a JSON object tagged by `op`. The Daemon delivers
/// publications to subscribers as `op: "message"`, which decodes to
/// [`Envelope::Publish`] as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Envelope {
    #[serde(alias = "message")]
    Publish {
        topic: String,
        sender: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "call_service")]
    ServiceRequest {
        service: String,
        request_id: CorrelationId,
        #[serde(default)]
        payload: Value,
        caller_id: String,
    },
    ServiceResponse {
        service: String,
        request_id: CorrelationId,
        #[serde(default)]
        payload: Value,
        caller_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Subscribe {
        topic: String,
        node_id: String,
    },
    AdvertiseService {
        service: String,
        node_id: String,
    },
}

impl Envelope {
    pub fn publish(topic: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self::Publish {
            topic: topic.into(),
            sender: sender.into(),
            payload,
        }
    }

    pub fn service_request(
        service: impl Into<String>,
        request_id: CorrelationId,
        payload: Value,
        caller_id: impl Into<String>,
    ) -> Self {
        Self::ServiceRequest {
            service: service.into(),
            request_id,
            payload,
            caller_id: caller_id.into(),
        }
    }

    pub fn service_success(
        service: impl Into<String>,
        request_id: CorrelationId,
        payload: Value,
        caller_id: impl Into<String>,
    ) -> Self {
        Self::ServiceResponse {
            service: service.into(),
            request_id,
            payload,
            caller_id: caller_id.into(),
            error: None,
        }
    }

    /// Error response. The payload carries `{"error": message}` as well so
    /// peers that only read the payload still see the failure.
    pub fn service_error(
        service: impl Into<String>,
        request_id: CorrelationId,
        message: impl Into<String>,
        caller_id: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self::ServiceResponse {
            service: service.into(),
            request_id,
            payload: serde_json::json!({ "error": message.clone() }),
            caller_id: caller_id.into(),
            error: Some(message),
        }
    }

    pub fn subscribe(topic: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            node_id: node_id.into(),
        }
    }

    pub fn advertise_service(service: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::AdvertiseService {
            service: service.into(),
            node_id: node_id.into(),
        }
    }

    /// Wire name of this frame's `op` field.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Publish { .. } => OP_PUBLISH,
            Self::ServiceRequest { .. } => OP_CALL_SERVICE,
            Self::ServiceResponse { .. } => OP_SERVICE_RESPONSE,
            Self::Subscribe { .. } => OP_SUBSCRIBE,
            Self::AdvertiseService { .. } => OP_ADVERTISE_SERVICE,
        }
    }

    /// Announcements addressed to the Daemon rather than to another node.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Subscribe { .. } | Self::AdvertiseService { .. })
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
