//! # Device Registration and Login
//!
//! Handles the two credential exchanges with the platform:
//! 1. Registration: product key + name + version → platform id + secret
//! 2. Login: id + secret → session token + session endpoint
//!
//! The platform reports business failures inside HTTP 200 bodies, so every
//! response is checked twice: once for the exchange itself, once for the
//! embedded status.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use shared::{
    constants::CONTENT_TYPE_JSON,
    error::{AgentError, AgentResult, CredentialFailure},
    types::{ApiResponse, DeviceIdentity, LoginData, LoginRequest, RegisterData, RegisterRequest, Topics},
};

use crate::http::HttpClient;
use crate::identity::IdentityStore;

/// Fields issued by a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: i64,
    pub secret: String,
}

/// Fields issued by a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub token: Vec<u8>,
    pub access: String,
}

/// Registration and login against the platform's REST endpoints
pub struct CredentialClient {
    /// HTTP capability
    http: Arc<dyn HttpClient>,

    /// Registration endpoint URL
    register_url: String,

    /// Login endpoint URL
    login_url: String,

    /// Where issued credentials are persisted
    store: IdentityStore,
}

impl CredentialClient {
    /// Create a client for the endpoints named in `topics`
    pub fn new(http: Arc<dyn HttpClient>, topics: &Topics, store: IdentityStore) -> Self {
        Self {
            http,
            register_url: topics.register.clone(),
            login_url: topics.login.clone(),
            store,
        }
    }

    /// The identity store credentials are persisted into
    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    /// Ask the platform for an id and secret. Does not touch `identity`.
    pub async fn request_registration(&self, identity: &DeviceIdentity) -> AgentResult<Registration> {
        if identity.product_key.is_empty() {
            return Err(AgentError::RegistrationError(CredentialFailure::MissingField("product key")));
        }
        if identity.name.is_empty() {
            return Err(AgentError::RegistrationError(CredentialFailure::MissingField("device name")));
        }

        let request = RegisterRequest::from(identity);
        let data: RegisterData = self
            .exchange(&self.register_url, &request, AgentError::RegistrationError)
            .await?;

        if data.id == 0 {
            return Err(AgentError::RegistrationError(CredentialFailure::MissingField("platform id")));
        }

        Ok(Registration {
            id: data.id,
            secret: data.secret,
        })
    }

    /// Ask the platform for a session token. Does not touch `identity`.
    pub async fn request_login(&self, identity: &DeviceIdentity) -> AgentResult<SessionGrant> {
        if identity.id == 0 {
            return Err(AgentError::LoginError(CredentialFailure::MissingField("platform id")));
        }
        if identity.secret.is_empty() {
            return Err(AgentError::LoginError(CredentialFailure::MissingField("secret")));
        }

        let request = LoginRequest {
            id: identity.id,
            secret: identity.secret.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let data: LoginData = self
            .exchange(&self.login_url, &request, AgentError::LoginError)
            .await?;

        let token = hex::decode(&data.access_token)
            .map_err(|e| AgentError::LoginError(CredentialFailure::InvalidToken(e.to_string())))?;

        if token.is_empty() || data.access_addr.is_empty() {
            return Err(AgentError::LoginError(CredentialFailure::MissingField(
                "access token or address",
            )));
        }

        Ok(SessionGrant {
            token,
            access: data.access_addr,
        })
    }

    /// Register the device, assign `id` and `secret`, persist.
    ///
    /// `identity` is only modified once the result is persisted.
    pub async fn register(&self, identity: &mut DeviceIdentity) -> AgentResult<()> {
        info!(
            device = %identity.name,
            product_key = %identity.product_key,
            "Registering device"
        );

        let registration = self.request_registration(identity).await?;
        let mut updated = identity.clone();
        updated.id = registration.id;
        updated.secret = registration.secret;
        self.store.save(&updated).await?;
        *identity = updated;

        info!(device = %identity.name, id = identity.id, "Device registered");
        Ok(())
    }

    /// Log the device in, assign `token` and `access` together, persist.
    ///
    /// `identity` is only modified once the result is persisted.
    pub async fn login(&self, identity: &mut DeviceIdentity) -> AgentResult<()> {
        debug!(device = %identity.name, id = identity.id, "Logging in");

        let grant = self.request_login(identity).await?;
        let mut updated = identity.clone();
        updated.token = grant.token;
        updated.access = grant.access;
        self.store.save(&updated).await?;
        *identity = updated;

        info!(device = %identity.name, access = %identity.access, "Device logged in");
        Ok(())
    }

    /// Register when the device has neither session credentials nor a
    /// platform id/secret, then log in.
    pub async fn auto_login(&self, identity: &mut DeviceIdentity) -> AgentResult<()> {
        if identity.needs_registration() {
            self.register(identity).await?;
        }
        self.login(identity).await
    }

    /// POST `request` as JSON and unwrap the platform envelope
    async fn exchange<Req, Data>(
        &self,
        url: &str,
        request: &Req,
        wrap: fn(CredentialFailure) -> AgentError,
    ) -> AgentResult<Data>
    where
        Req: Serialize + Sync,
        Data: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)
            .map_err(|e| wrap(CredentialFailure::Decode(e.to_string())))?;

        let response = self
            .http
            .post(url, CONTENT_TYPE_JSON, body)
            .await
            .map_err(|e| wrap(CredentialFailure::Transport(e.to_string())))?;

        let envelope: ApiResponse<Data> = match serde_json::from_slice(&response.body) {
            Ok(envelope) => envelope,
            Err(e) if !(200..300).contains(&response.status) => {
                warn!(url = %url, status = response.status, "Platform returned an undecodable error");
                return Err(wrap(CredentialFailure::Transport(format!(
                    "HTTP {}: {}",
                    response.status, e
                ))));
            }
            Err(e) => return Err(wrap(CredentialFailure::Decode(e.to_string()))),
        };

        if !envelope.is_ok() {
            return Err(wrap(CredentialFailure::Rejected {
                status: envelope.status,
                message: envelope.message,
            }));
        }

        envelope
            .data
            .ok_or_else(|| wrap(CredentialFailure::Decode("response carries no data".into())))
    }
}
