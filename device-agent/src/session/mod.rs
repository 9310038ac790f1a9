//! # Session Manager
//!
//! Owns the [`Transport`] and opens sessions from the device identity:
//! broker = `access`, client id = username = decimal `id`,
//! password = hex `token`. Logical [`Request`] descriptors are formatted
//! into the transport's publish/subscribe shape and forwarded as-is; there
//! is no buffering at this layer.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use shared::{
    error::{AgentError, AgentResult},
    types::DeviceIdentity,
};

use crate::transport::{
    MessageCallback, PublishRequest, ReconnectHook, SessionDescriptor, SubscribeRequest, Transport,
};

/// Logical request descriptor shared by publish and subscribe
#[derive(Clone, Default)]
pub struct Request {
    pub topic: String,
    pub qos: u8,
    pub retained: bool,
    pub payload: Vec<u8>,
    pub callback: Option<MessageCallback>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("retained", &self.retained)
            .field("payload_len", &self.payload.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Request {
    /// A publish of `payload` on `topic`
    pub fn publish(topic: impl Into<String>, qos: u8, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload,
            ..Self::default()
        }
    }

    /// A subscription to `topic` delivering to `callback`
    pub fn subscribe(topic: impl Into<String>, qos: u8, callback: MessageCallback) -> Self {
        Self {
            topic: topic.into(),
            qos,
            callback: Some(callback),
            ..Self::default()
        }
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    fn check_common(&self) -> AgentResult<()> {
        if self.topic.is_empty() {
            return Err(AgentError::InvalidRequest("topic must not be empty".into()));
        }
        if self.qos > 2 {
            return Err(AgentError::InvalidRequest(format!("invalid QoS {}", self.qos)));
        }
        Ok(())
    }

    /// Format as a transport publish
    pub fn into_publish(self) -> AgentResult<PublishRequest> {
        self.check_common()?;
        if self.topic.contains(['+', '#']) {
            return Err(AgentError::InvalidRequest(format!(
                "cannot publish to wildcard topic '{}'",
                self.topic
            )));
        }
        Ok(PublishRequest {
            topic: self.topic,
            qos: self.qos,
            retained: self.retained,
            payload: self.payload,
        })
    }

    /// Format as a transport subscription
    pub fn into_subscribe(self) -> AgentResult<SubscribeRequest> {
        self.check_common()?;
        let callback = self.callback.ok_or_else(|| {
            AgentError::InvalidRequest(format!("subscription to '{}' has no callback", self.topic))
        })?;
        Ok(SubscribeRequest {
            topic: self.topic,
            qos: self.qos,
            callback,
        })
    }
}

/// Opens transport sessions and forwards publish/subscribe calls
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    keep_alive: Duration,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, keep_alive: Duration) -> Self {
        Self { transport, keep_alive }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Derive the default descriptor from `identity`
    pub fn descriptor_for(
        &self,
        identity: &DeviceIdentity,
        reconnect: Option<Arc<dyn ReconnectHook>>,
    ) -> SessionDescriptor {
        let id = identity.id_string();
        let mut descriptor = SessionDescriptor::new(identity.access.clone(), id.clone())
            .with_credentials(id, identity.token_hex())
            .with_keep_alive(self.keep_alive);
        descriptor.reconnect = reconnect;
        descriptor
    }

    /// Open a session.
    ///
    /// An `explicit` descriptor is passed through untouched; otherwise one
    /// is derived from `identity` with `reconnect` attached.
    pub async fn open(
        &self,
        identity: &DeviceIdentity,
        explicit: Option<SessionDescriptor>,
        reconnect: Option<Arc<dyn ReconnectHook>>,
    ) -> AgentResult<()> {
        let descriptor = match explicit {
            Some(descriptor) => {
                debug!(broker = %descriptor.broker, "Opening session with explicit descriptor");
                descriptor
            }
            None => {
                if !identity.has_session_credentials() {
                    return Err(AgentError::session("open", "identity holds no session credentials"));
                }
                self.descriptor_for(identity, reconnect)
            }
        };

        info!(
            transport = self.transport.name(),
            broker = %descriptor.broker,
            client_id = %descriptor.client_id,
            "Opening session"
        );

        self.transport.new_client(descriptor).await
    }

    pub async fn publish(&self, request: Request) -> AgentResult<()> {
        let request = request.into_publish()?;
        debug!(topic = %request.topic, qos = request.qos, bytes = request.payload.len(), "Publishing");
        self.transport.publish(request).await
    }

    pub async fn subscribe(&self, request: Request) -> AgentResult<()> {
        let request = request.into_subscribe()?;
        debug!(topic = %request.topic, qos = request.qos, "Subscribing");
        self.transport.subscribe(request).await
    }

    pub async fn unsubscribe(&self, topics: &[String]) -> AgentResult<()> {
        debug!(topics = ?topics, "Unsubscribing");
        self.transport.unsubscribe(topics).await
    }

    /// Whether the transport reports a live session instance
    pub fn is_live(&self) -> bool {
        self.transport.has_instance()
    }

    pub async fn close(&self) -> AgentResult<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, StaticPassword};

    fn session_identity() -> DeviceIdentity {
        DeviceIdentity {
            id: 42,
            secret: "abc".into(),
            token: vec![0x81, 0x7a, 0xec, 0xf0],
            access: "tcp://broker:1883".into(),
            ..DeviceIdentity::new("pk", "lamp", "1.0.0")
        }
    }

    fn manager() -> (Arc<MockTransport>, SessionManager) {
        let transport = Arc::new(MockTransport::new());
        let manager = SessionManager::new(transport.clone(), Duration::from_secs(30));
        (transport, manager)
    }

    #[tokio::test]
    async fn test_open_derives_descriptor_from_identity() {
        let (transport, manager) = manager();
        let hook: Arc<dyn ReconnectHook> = Arc::new(StaticPassword("fresh".into()));

        manager.open(&session_identity(), None, Some(hook)).await.unwrap();

        let descriptor = transport.last_descriptor().unwrap();
        assert_eq!(descriptor.broker, "tcp://broker:1883");
        assert_eq!(descriptor.client_id, "42");
        assert_eq!(descriptor.username, "42");
        assert_eq!(descriptor.password, "817aecf0");
        assert_eq!(descriptor.keep_alive, Duration::from_secs(30));
        assert_eq!(
            descriptor.reconnect.unwrap().refresh_password().await.unwrap(),
            "fresh"
        );
        assert!(manager.is_live());
    }

    #[tokio::test]
    async fn test_open_passes_explicit_descriptor_verbatim() {
        let (transport, manager) = manager();
        let explicit = SessionDescriptor::new("tcp://custom:9999", "custom-client")
            .with_credentials("user", "pass")
            .with_keep_alive(Duration::from_secs(120));

        // Identity without credentials is fine when the caller supplies everything
        manager
            .open(&DeviceIdentity::default(), Some(explicit), None)
            .await
            .unwrap();

        let descriptor = transport.last_descriptor().unwrap();
        assert_eq!(descriptor.broker, "tcp://custom:9999");
        assert_eq!(descriptor.client_id, "custom-client");
        assert_eq!(descriptor.password, "pass");
        assert_eq!(descriptor.keep_alive, Duration::from_secs(120));
        assert!(descriptor.reconnect.is_none());
    }

    #[tokio::test]
    async fn test_open_without_credentials_fails() {
        let (transport, manager) = manager();
        let err = manager
            .open(&DeviceIdentity::new("pk", "lamp", "1"), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "session");
        assert!(transport.last_descriptor().is_none());
    }

    #[tokio::test]
    async fn test_publish_formats_request() {
        let (transport, manager) = manager();
        manager
            .publish(Request::publish("s/1", 1, vec![9, 9]).retained(true))
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "s/1");
        assert_eq!(published[0].qos, 1);
        assert!(published[0].retained);
        assert_eq!(published[0].payload, vec![9, 9]);
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_transport() {
        let (transport, manager) = manager();

        assert!(manager.publish(Request::publish("", 1, vec![])).await.is_err());
        assert!(manager.publish(Request::publish("s/1", 3, vec![])).await.is_err());
        assert!(manager.publish(Request::publish("s/+", 0, vec![])).await.is_err());
        assert!(manager
            .subscribe(Request { topic: "c/1".into(), ..Request::default() })
            .await
            .is_err());

        assert!(transport.published().is_empty());
        assert!(transport.subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_forward() {
        let (transport, manager) = manager();
        let callback: MessageCallback = Arc::new(|_| {});

        manager.subscribe(Request::subscribe("c/1", 1, callback)).await.unwrap();
        assert_eq!(transport.subscribed_topics(), vec!["c/1".to_string()]);

        manager.unsubscribe(&["c/1".to_string()]).await.unwrap();
        assert!(transport.subscribed_topics().is_empty());
    }
}
