//! # Payload Serializer
//!
//! Converts properties, events and commands to and from wire payloads.
//! The agent only depends on the [`Serializer`] trait; [`JsonSerializer`]
//! is the bundled implementation.

use serde::Serialize;

use shared::{
    error::{AgentError, AgentResult},
    types::{Command, Property, Value},
};

/// Payload encoding capability
pub trait Serializer: Send + Sync {
    /// Encode a list of values
    fn marshal(&self, values: &[Value]) -> AgentResult<Vec<u8>>;

    /// Encode a property report
    fn make_property_payload(&self, property: &Property) -> AgentResult<Vec<u8>>;

    /// Encode an event report carrying `identifier`
    fn make_event_payload(&self, identifier: &str, property: &Property) -> AgentResult<Vec<u8>>;

    /// Decode an inbound command
    fn unmarshal_command(&self, payload: &[u8]) -> AgentResult<Command>;
}

/// JSON payloads.
///
/// Property: `{"propertyId":1,"subDeviceId":"","value":[...]}`.
/// Event: the property fields plus `"identifier"`.
/// Command: `{"id":7,"subDeviceId":"sub1","params":{"0":"x"}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload<'a> {
    identifier: &'a str,
    #[serde(flatten)]
    property: &'a Property,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for JsonSerializer {
    fn marshal(&self, values: &[Value]) -> AgentResult<Vec<u8>> {
        Ok(serde_json::to_vec(values)?)
    }

    fn make_property_payload(&self, property: &Property) -> AgentResult<Vec<u8>> {
        Ok(serde_json::to_vec(property)?)
    }

    fn make_event_payload(&self, identifier: &str, property: &Property) -> AgentResult<Vec<u8>> {
        if identifier.is_empty() {
            return Err(AgentError::SerializationError(
                "event identifier must not be empty".into(),
            ));
        }
        Ok(serde_json::to_vec(&EventPayload { identifier, property })?)
    }

    fn unmarshal_command(&self, payload: &[u8]) -> AgentResult<Command> {
        Ok(serde_json::from_slice(payload)?)
    }
}
