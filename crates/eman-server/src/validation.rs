//! Required-field validation for routed messages.
//!
//! A field counts as missing when it is absent or holds a falsy value:
//! `null`, `false`, `0`, or the empty string.

use serde_json::Value;

use crate::errors::BrokerError;

/// Fixed list of fields a message kind must carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequiredFields(&'static [&'static str]);

impl RequiredFields {
    /// Fields of an `api:request`.
    pub const REQUEST: Self = Self(&["name", "request_id", "sender_id"]);
    /// Fields of an `api:response`.
    pub const RESPONSE: Self = Self(&["name", "request_id", "sender_id", "recipient_id"]);
    /// Fields of a subscription management message.
    pub const SUBSCRIPTION: Self = Self(&["name"]);

    /// The field names, in declaration order.
    pub fn fields(&self) -> &'static [&'static str] {
        self.0
    }

    /// Names of the fields `payload` lacks, in declaration order.
    pub fn missing(&self, payload: &Value) -> Vec<&'static str> {
        self.0
            .iter()
            .copied()
            .filter(|field| !is_present(payload.get(*field)))
            .collect()
    }

    /// Check `payload`, failing with `no_required_fields` listing the gaps.
    pub fn check(&self, payload: &Value) -> Result<(), BrokerError> {
        let missing = self.missing(payload);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::NoRequiredFields { missing })
        }
    }
}

/// Whether a looked-up value is present and truthy.
pub fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null | Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Bool(true) | Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Look up `key` and return it when present and truthy.
pub fn present<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.get(key).filter(|v| is_present(Some(v)))
}
