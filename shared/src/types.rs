//! # Shared Data Types for the IoT Device Agent
//!
//! Device identity, application message shapes and the request/response
//! bodies exchanged with the platform's REST API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::PLATFORM_STATUS_OK;

// =============================================================================
// DEVICE IDENTITY
// =============================================================================

/// The durable set of fields identifying a device to the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Product classifier, immutable once set
    pub product_key: String,

    /// Logical device name, also the storage namespace
    pub name: String,

    /// Firmware/software version reported at registration
    pub version: String,

    /// Shared secret issued at registration
    pub secret: String,

    /// Platform-assigned id; 0 means "not yet registered"
    pub id: i64,

    /// Session token issued at login; empty means "not logged in"
    pub token: Vec<u8>,

    /// Session endpoint (broker address) issued at login
    pub access: String,
}

impl DeviceIdentity {
    /// Create an identity that has not been registered yet
    pub fn new(
        product_key: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            product_key: product_key.into(),
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Whether the platform has issued an id and a secret
    pub fn is_registered(&self) -> bool {
        self.id != 0 && !self.secret.is_empty()
    }

    /// Whether a session token and endpoint are present
    pub fn has_session_credentials(&self) -> bool {
        !self.token.is_empty() && !self.access.is_empty()
    }

    /// Whether `auto_login` has to register before logging in
    pub fn needs_registration(&self) -> bool {
        !self.has_session_credentials() && !self.is_registered()
    }

    /// Decimal form of the id, used as MQTT client id and username
    pub fn id_string(&self) -> String {
        self.id.to_string()
    }

    /// Hex form of the token, used as MQTT password
    pub fn token_hex(&self) -> String {
        hex::encode(&self.token)
    }

    /// Fill every empty field from `persisted`.
    ///
    /// Non-default fields already in memory win; persisted values only
    /// fill the gaps, field by field.
    pub fn merge_missing(&mut self, persisted: DeviceIdentity) {
        fn fill(target: &mut String, source: String) {
            if target.is_empty() {
                *target = source;
            }
        }

        fill(&mut self.product_key, persisted.product_key);
        fill(&mut self.name, persisted.name);
        fill(&mut self.version, persisted.version);
        fill(&mut self.secret, persisted.secret);
        fill(&mut self.access, persisted.access);
        if self.id == 0 {
            self.id = persisted.id;
        }
        if self.token.is_empty() {
            self.token = persisted.token;
        }
    }
}

// =============================================================================
// APPLICATION VALUES
// =============================================================================

/// A typed value carried by properties, events and command parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl Value {
    /// Parse a command-line literal: bool, integer, float, else string
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            return Value::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Value::Float(f);
        }
        Value::String(raw.to_string())
    }
}

/// Outbound state report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Property identifier within the product model
    pub property_id: u16,

    /// Sub-device the value belongs to; empty for the device itself
    #[serde(default)]
    pub sub_device_id: String,

    /// Reported values
    pub value: Vec<Value>,
}

impl Property {
    /// A property of the device itself
    pub fn new(property_id: u16, value: Vec<Value>) -> Self {
        Self {
            property_id,
            sub_device_id: String::new(),
            value,
        }
    }

    /// Attribute the property to a sub-device
    pub fn for_sub_device(mut self, sub_device_id: impl Into<String>) -> Self {
        self.sub_device_id = sub_device_id.into();
        self
    }
}

/// Parameters of an inbound command, keyed by parameter index
pub type CommandParams = HashMap<i32, Value>;

/// Inbound instruction decoded from the command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Command identifier within the product model
    pub id: u16,

    /// Addressed sub-device; empty for the device itself
    #[serde(default)]
    pub sub_device_id: String,

    /// Command parameters
    #[serde(default)]
    pub params: CommandParams,
}

// =============================================================================
// TOPIC TABLE
// =============================================================================

/// Static mapping from logical operation to its address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    /// Registration endpoint URL
    pub register: String,

    /// Login endpoint URL
    pub login: String,

    /// Property report topic
    pub post_property: String,

    /// Event report topic
    pub post_event: String,

    /// Command topic
    pub on_command: String,
}

impl Default for Topics {
    fn default() -> Self {
        use crate::constants::*;
        let platform = crate::config::PlatformConfig::default();
        Self {
            register: platform.register_url(),
            login: platform.login_url(),
            post_property: TOPIC_POST_PROPERTY.into(),
            post_event: TOPIC_POST_EVENT.into(),
            on_command: TOPIC_ON_COMMAND.into(),
        }
    }
}

// =============================================================================
// PLATFORM API TYPES
// =============================================================================

/// Envelope of every platform response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Business status; only [`PLATFORM_STATUS_OK`] means success
    pub status: i32,

    /// Human-readable status message
    #[serde(default)]
    pub message: String,

    /// Payload, absent on failure
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Whether the platform reported success
    pub fn is_ok(&self) -> bool {
        self.status == PLATFORM_STATUS_OK
    }
}

/// Device registration request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub product_key: String,
    pub name: String,
    pub version: String,
}

impl From<&DeviceIdentity> for RegisterRequest {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            product_key: identity.product_key.clone(),
            name: identity.name.clone(),
            version: identity.version.clone(),
        }
    }
}

/// Data of a successful registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterData {
    pub id: i64,
    pub secret: String,
}

/// Device login request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub id: i64,
    pub secret: String,
    /// Unix timestamp of the request (seconds)
    pub timestamp: i64,
}

/// Data of a successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    /// Session token, hex encoded
    pub access_token: String,
    /// Session endpoint
    pub access_addr: String,
}
