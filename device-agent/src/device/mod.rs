//! # Device
//!
//! The public face of the agent. A [`Device`] owns one identity and wires
//! together:
//! - the identity store (persistence)
//! - the credential client (registration and login over HTTP)
//! - the session manager (messaging transport)
//! - the lifecycle controller (automatic bring-up with retries)
//! - the messaging facade (properties, events, commands)
//!
//! Collaborators are chosen with [`DeviceBuilder`]; anything left unset
//! falls back to the bundled implementation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use shared::{
    config::{AgentConfig, RetryPolicy},
    constants::SESSION_KEEP_ALIVE_SECS,
    error::{AgentError, AgentResult},
    types::{DeviceIdentity, Property, Topics},
};

use crate::http::{HttpClient, ReqwestHttpClient};
use crate::identity::IdentityStore;
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::messaging::{CommandTable, MessagingFacade};
use crate::registration::CredentialClient;
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::{Request, SessionManager};
use crate::storage::{FileStorage, MemoryStorage, Storage};
use crate::transport::{MqttTransport, SessionDescriptor, Transport};

// =============================================================================
// BUILDER
// =============================================================================

/// Assembles a [`Device`] from its collaborators
pub struct DeviceBuilder {
    identity: DeviceIdentity,
    transport: Option<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    storage: Option<Arc<dyn Storage>>,
    http: Option<Arc<dyn HttpClient>>,
    topics: Topics,
    retry: RetryPolicy,
    keep_alive: Duration,
}

impl DeviceBuilder {
    fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            transport: None,
            serializer: None,
            storage: None,
            http: None,
            topics: Topics::default(),
            retry: RetryPolicy::default(),
            keep_alive: Duration::from_secs(SESSION_KEEP_ALIVE_SECS),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Wire the collaborators together
    pub fn build(self) -> AgentResult<Device> {
        let http = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new(&Default::default())?),
        };
        let storage = self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let transport = self.transport.unwrap_or_else(|| Arc::new(MqttTransport::default()));
        let serializer = self.serializer.unwrap_or_else(|| Arc::new(JsonSerializer::new()));

        let store = IdentityStore::new(storage);
        let credentials = Arc::new(CredentialClient::new(http, &self.topics, store.clone()));
        let session = Arc::new(SessionManager::new(transport, self.keep_alive));
        let identity = Arc::new(Mutex::new(self.identity));

        let lifecycle = LifecycleController::new(
            Arc::clone(&identity),
            Arc::clone(&credentials),
            Arc::clone(&session),
            self.retry,
        );
        let messaging = MessagingFacade::new(Arc::clone(&session), serializer, self.topics);

        Ok(Device {
            identity,
            store,
            credentials,
            session,
            lifecycle,
            messaging,
        })
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// One IoT device: identity, credentials, session and messaging
pub struct Device {
    identity: Arc<Mutex<DeviceIdentity>>,
    store: IdentityStore,
    credentials: Arc<CredentialClient>,
    session: Arc<SessionManager>,
    lifecycle: LifecycleController,
    messaging: MessagingFacade,
}

impl Device {
    /// Start building a device with the given provisioning identity
    pub fn builder(
        product_key: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> DeviceBuilder {
        DeviceBuilder::new(DeviceIdentity::new(product_key, name, version))
    }

    /// Build a device with file storage, reqwest and MQTT as described by `config`
    pub async fn from_config(config: &AgentConfig) -> AgentResult<Self> {
        config.validate()?;

        let storage = FileStorage::new(&config.storage).await?;
        let http = ReqwestHttpClient::new(&config.http)?;

        info!(
            device = %config.device.name,
            platform = %config.platform.base_url,
            storage = ?storage.path(),
            "Building device from configuration"
        );

        Self::builder(
            config.device.product_key.clone(),
            config.device.name.clone(),
            config.device.version.clone(),
        )
        .storage(Arc::new(storage))
        .http_client(Arc::new(http))
        .transport(Arc::new(MqttTransport::new(config.session.channel_capacity)))
        .topics(config.topics())
        .retry_policy(config.retry.clone())
        .keep_alive(config.session.keep_alive())
        .build()
    }

    /// Snapshot of the current identity
    pub async fn identity(&self) -> DeviceIdentity {
        self.identity.lock().await.clone()
    }

    /// Lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.lifecycle.policy()
    }

    /// Fill empty identity fields from storage
    pub async fn load_device_info(&self) -> AgentResult<()> {
        let mut identity = self.identity.lock().await;
        self.store.refresh(&mut identity).await
    }

    /// Replace the identity and persist its non-empty fields
    pub async fn set_device_info(&self, identity: DeviceIdentity) -> AgentResult<()> {
        if identity.name.is_empty() {
            return Err(AgentError::InvalidRequest("device name must not be empty".into()));
        }
        let mut current = self.identity.lock().await;
        self.store.save(&identity).await?;
        debug!(device = %identity.name, "Device info replaced");
        *current = identity;
        Ok(())
    }

    /// Persist the non-empty fields of the current identity
    pub async fn save(&self) -> AgentResult<()> {
        let identity = self.identity.lock().await;
        self.store.save(&identity).await
    }

    pub async fn register(&self) -> AgentResult<()> {
        let mut identity = self.identity.lock().await;
        self.credentials.register(&mut identity).await
    }

    pub async fn login(&self) -> AgentResult<()> {
        let mut identity = self.identity.lock().await;
        self.credentials.login(&mut identity).await
    }

    /// Register if needed, then log in; a single attempt each
    pub async fn auto_login(&self) -> AgentResult<()> {
        let mut identity = self.identity.lock().await;
        self.credentials.auto_login(&mut identity).await
    }

    /// Register under the configured registration rule
    pub async fn register_with_retry(&self, cancel: &CancellationToken) -> AgentResult<()> {
        self.lifecycle.register(cancel).await
    }

    /// Register if needed, then log in, under the configured relogin rule
    pub async fn login_with_retry(&self, cancel: &CancellationToken) -> AgentResult<()> {
        self.lifecycle.login(cancel).await
    }

    /// Open the messaging session from the identity, or from `explicit`
    pub async fn init_session(&self, explicit: Option<SessionDescriptor>) -> AgentResult<()> {
        self.lifecycle.init_session(explicit).await
    }

    /// Bring the device up with the configured retry policy
    pub async fn auto_init(&self, cancel: &CancellationToken) -> AgentResult<()> {
        self.lifecycle.auto_init(cancel).await
    }

    /// Whether a messaging session is live
    pub fn is_live(&self) -> bool {
        self.session.is_live()
    }

    pub async fn post_property(&self, property: &Property) -> AgentResult<()> {
        self.messaging.post_property(property).await
    }

    pub async fn post_event(&self, identifier: &str, property: &Property) -> AgentResult<()> {
        self.messaging.post_event(identifier, property).await
    }

    /// Bring the session up if necessary, then post `property`.
    ///
    /// Bring-up failures are wrapped in [`AgentError::AutoInitFailed`].
    pub async fn auto_post_property(
        &self,
        property: &Property,
        cancel: &CancellationToken,
    ) -> AgentResult<()> {
        if !self.session.is_live() {
            self.lifecycle
                .auto_init(cancel)
                .await
                .map_err(|e| AgentError::AutoInitFailed(Box::new(e)))?;
        }
        self.messaging.post_property(property).await
    }

    pub async fn on_command(&self, table: CommandTable) -> AgentResult<()> {
        self.messaging.on_command(table).await
    }

    /// Raw publish on an arbitrary topic
    pub async fn publish(&self, request: Request) -> AgentResult<()> {
        self.session.publish(request).await
    }

    /// Raw subscription on an arbitrary topic
    pub async fn subscribe(&self, request: Request) -> AgentResult<()> {
        self.session.subscribe(request).await
    }

    pub async fn unsubscribe(&self, topics: &[String]) -> AgentResult<()> {
        self.session.unsubscribe(topics).await
    }

    /// Close the messaging session
    pub async fn close(&self) -> AgentResult<()> {
        self.session.close().await
    }
}
