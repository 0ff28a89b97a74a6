//! Wire format: every WebSocket text frame carries one named event.
//!
//! ```json
//! {"event": "shake_i_am", "data": {"name": "billing", "key": "x"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client: identity challenge.
pub const SHAKE_WHO: &str = "shake_who";
/// Client → server: identity declaration `{name, key}`.
pub const SHAKE_I_AM: &str = "shake_i_am";
/// Server → client: issued service id `{id}`.
pub const SHAKE_ID: &str = "shake_id";
/// Client → server: readiness confirmation `{id}`.
pub const SHAKE_READY: &str = "shake_ready";
/// Server → client: connection admitted.
pub const SHAKE_ONLINE: &str = "shake_online";
/// Server → client: handshake failure.
pub const SHAKE_ERROR: &str = "shake_error";

/// Client → server: application request.
pub const API_REQUEST: &str = "api:request";
/// Client → server (and server → requester): application response.
pub const API_RESPONSE: &str = "api:response";
/// Server → client: rejected request.
pub const API_REQUEST_ERROR: &str = "api:request:error";
/// Server → client: rejected response.
pub const API_RESPONSE_ERROR: &str = "api:response:error";

/// Client → server: declare interest in an event name.
pub const SERVICE_SUBSCRIBE: &str = "_service:api:request:subscribe";
/// Client → server: withdraw interest in an event name.
pub const SERVICE_UNSUBSCRIBE: &str = "_service:api:request:unsubscribe";
/// Server → client: rejected subscription management message.
pub const SERVICE_ERROR: &str = "_service:error";

/// Broadcast group every online service joins for request fan-out.
pub const REQUEST_FLOW_GROUP: &str = "request_flow";

/// Whether `event` belongs to the handshake exchange.
pub fn is_handshake_event(event: &str) -> bool {
    event.starts_with("shake_")
}

/// A single named event travelling over a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name.
    pub event: String,
    /// Event payload (`null` when the event carries none).
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Build a frame with a payload.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build a frame with no payload.
    pub fn bare(event: impl Into<String>) -> Self {
        Self::new(event, Value::Null)
    }

    /// Decode a frame from its JSON text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode the frame as JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Render a payload value as the string it names.
///
/// Strings are used verbatim; any other value uses its JSON text.
pub fn value_as_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
