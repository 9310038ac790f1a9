//! # Messaging Transport Capability
//!
//! The session manager drives a publish/subscribe transport through the
//! [`Transport`] trait. Connection settings travel in a closed
//! [`SessionDescriptor`] that is validated before use; each concrete
//! transport (MQTT by default) implements the trait.

pub mod mqtt;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use shared::{
    constants::{MQTT_DEFAULT_PORT, SESSION_KEEP_ALIVE_SECS},
    error::{AgentError, AgentResult},
};

pub use mqtt::MqttTransport;

/// A message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Callback invoked for every inbound message of a subscription.
///
/// Runs on the transport's delivery task, possibly concurrently with
/// outbound publishes.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Supplies a fresh password when the transport reconnects on its own
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn refresh_password(&self) -> AgentResult<String>;
}

// =============================================================================
// SESSION DESCRIPTOR
// =============================================================================

/// Everything a transport needs to open an authenticated session
#[derive(Clone)]
pub struct SessionDescriptor {
    /// Broker address, `[scheme://]host[:port]`
    pub broker: String,

    /// Client identifier
    pub client_id: String,

    /// Username
    pub username: String,

    /// Password
    pub password: String,

    /// Keep-alive interval
    pub keep_alive: Duration,

    /// Called on transport-level disconnect to refresh the password
    pub reconnect: Option<Arc<dyn ReconnectHook>>,
}

impl fmt::Debug for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescriptor")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keep_alive", &self.keep_alive)
            .field("reconnect", &self.reconnect.is_some())
            .finish()
    }
}

impl SessionDescriptor {
    /// Descriptor without credentials and with the default keep-alive
    pub fn new(broker: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            client_id: client_id.into(),
            username: String::new(),
            password: String::new(),
            keep_alive: Duration::from_secs(SESSION_KEEP_ALIVE_SECS),
            reconnect: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_reconnect_hook(mut self, hook: Arc<dyn ReconnectHook>) -> Self {
        self.reconnect = Some(hook);
        self
    }

    /// Check the descriptor can be handed to a transport
    pub fn validate(&self) -> AgentResult<()> {
        if self.client_id.is_empty() {
            return Err(AgentError::InvalidRequest("client id must not be empty".into()));
        }
        if self.keep_alive < Duration::from_secs(1) {
            return Err(AgentError::InvalidRequest(format!(
                "keep-alive of {:?} is too short",
                self.keep_alive
            )));
        }
        self.host_port().map(|_| ())
    }

    /// Split the broker address into host and port
    pub fn host_port(&self) -> AgentResult<(String, u16)> {
        let invalid = |reason: &str| {
            AgentError::InvalidRequest(format!("broker address '{}' {}", self.broker, reason))
        };

        let rest = match self.broker.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => return Err(invalid(&format!("uses unsupported scheme '{}'", scheme))),
            None => self.broker.as_str(),
        };
        let rest = rest.trim_end_matches('/');

        if rest.is_empty() {
            return Err(invalid("is empty"));
        }

        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("has an invalid port"))?;
                if host.is_empty() {
                    return Err(invalid("has no host"));
                }
                Ok((host.to_string(), port))
            }
            None => Ok((rest.to_string(), MQTT_DEFAULT_PORT)),
        }
    }
}

// =============================================================================
// TRANSPORT REQUESTS
// =============================================================================

/// A formatted publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub qos: u8,
    pub retained: bool,
    pub payload: Vec<u8>,
}

/// A formatted subscription
#[derive(Clone)]
pub struct SubscribeRequest {
    pub topic: String,
    pub qos: u8,
    pub callback: MessageCallback,
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// A publish/subscribe messaging transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Open (or replace) the session described by `descriptor`
    async fn new_client(&self, descriptor: SessionDescriptor) -> AgentResult<()>;

    async fn publish(&self, request: PublishRequest) -> AgentResult<()>;

    async fn subscribe(&self, request: SubscribeRequest) -> AgentResult<()>;

    async fn unsubscribe(&self, topics: &[String]) -> AgentResult<()>;

    /// Liveness probe: whether a session instance currently exists
    fn has_instance(&self) -> bool;

    /// Close the session, if any
    async fn close(&self) -> AgentResult<()> {
        Ok(())
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
