//! # Lifecycle Controller
//!
//! Drives a device from "nothing known" to an open messaging session:
//!
//! ```text
//! Unconnected ──auto_init──▶ SessionPending ──login + open──▶ SessionActive
//!      ▲                           │                               │
//!      └──────── failure ──────────┘                   live session = Operational
//! ```
//!
//! Each phase runs under its own [`RetryRule`]: a disabled rule returns the
//! first failure, an enabled rule sleeps its interval and tries again until
//! success. Sleeps and attempts observe a [`CancellationToken`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shared::{
    config::{RetryPolicy, RetryRule},
    error::{AgentError, AgentResult},
    types::DeviceIdentity,
};

use crate::registration::CredentialClient;
use crate::session::SessionManager;
use crate::transport::{ReconnectHook, SessionDescriptor};

/// Where the device stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No session, nothing in progress
    Unconnected,
    /// Credentials or session being established
    SessionPending,
    /// Session opened by this controller
    SessionActive,
    /// A live session exists
    Operational,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Unconnected => write!(f, "unconnected"),
            LifecycleState::SessionPending => write!(f, "session-pending"),
            LifecycleState::SessionActive => write!(f, "session-active"),
            LifecycleState::Operational => write!(f, "operational"),
        }
    }
}

/// Logs in again when the transport reconnects and hands back the new token
struct LoginRefresher {
    identity: Arc<Mutex<DeviceIdentity>>,
    credentials: Arc<CredentialClient>,
}

#[async_trait]
impl ReconnectHook for LoginRefresher {
    async fn refresh_password(&self) -> AgentResult<String> {
        let mut identity = self.identity.lock().await;
        info!(device = %identity.name, "Session lost, refreshing token");
        self.credentials.login(&mut identity).await?;
        Ok(identity.token_hex())
    }
}

/// The device lifecycle state machine
pub struct LifecycleController {
    identity: Arc<Mutex<DeviceIdentity>>,
    credentials: Arc<CredentialClient>,
    session: Arc<SessionManager>,
    policy: RetryPolicy,
    state: RwLock<LifecycleState>,
    /// Failed attempts that were followed by a retry
    retries: AtomicU64,
}

impl LifecycleController {
    pub fn new(
        identity: Arc<Mutex<DeviceIdentity>>,
        credentials: Arc<CredentialClient>,
        session: Arc<SessionManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            identity,
            credentials,
            session,
            policy,
            state: RwLock::new(LifecycleState::Unconnected),
            retries: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current state; a session opened earlier but no longer live reads
    /// as `Unconnected`
    pub fn state(&self) -> LifecycleState {
        let state = *self.state.read();
        match state {
            LifecycleState::SessionActive | LifecycleState::Operational => {
                if self.session.is_live() {
                    LifecycleState::Operational
                } else {
                    LifecycleState::Unconnected
                }
            }
            other => other,
        }
    }

    /// Number of retries performed so far, across all phases
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = %previous, to = %state, "Lifecycle transition");
        }
    }

    /// Bring the device to an open session.
    ///
    /// No-op when the transport already reports a live session.
    pub async fn auto_init(&self, cancel: &CancellationToken) -> AgentResult<()> {
        if self.session.is_live() {
            self.set_state(LifecycleState::Operational);
            return Ok(());
        }

        self.set_state(LifecycleState::SessionPending);

        match self.establish(cancel).await {
            Ok(()) => {
                self.set_state(LifecycleState::SessionActive);
                info!("Device session established");
                Ok(())
            }
            Err(e) => {
                self.set_state(LifecycleState::Unconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self, cancel: &CancellationToken) -> AgentResult<()> {
        {
            let mut identity = self.identity.lock().await;
            self.credentials.store().refresh(&mut identity).await?;
        }

        self.login(cancel).await?;

        self.retry("session", self.policy.reinit_session, cancel, move || async move {
            self.init_session(None).await
        })
        .await
    }

    /// Register with the platform under the registration rule
    pub async fn register(&self, cancel: &CancellationToken) -> AgentResult<()> {
        self.retry("registration", self.policy.reregister, cancel, move || async move {
            let mut identity = self.identity.lock().await;
            self.credentials.register(&mut identity).await
        })
        .await
    }

    /// The whole credential step under the relogin rule
    pub async fn login(&self, cancel: &CancellationToken) -> AgentResult<()> {
        self.retry("login", self.policy.relogin, cancel, move || async move {
            self.auto_login(cancel).await
        })
        .await
    }

    /// One credential attempt: register if needed (under the registration
    /// rule), then log in
    pub async fn auto_login(&self, cancel: &CancellationToken) -> AgentResult<()> {
        let needs_registration = self.identity.lock().await.needs_registration();

        if needs_registration {
            self.register(cancel).await?;
        }

        let mut identity = self.identity.lock().await;
        self.credentials.login(&mut identity).await
    }

    /// Open the transport session, from `explicit` or from the identity
    pub async fn init_session(&self, explicit: Option<SessionDescriptor>) -> AgentResult<()> {
        let identity = self.identity.lock().await.clone();
        let hook: Arc<dyn ReconnectHook> = Arc::new(LoginRefresher {
            identity: Arc::clone(&self.identity),
            credentials: Arc::clone(&self.credentials),
        });

        self.session.open(&identity, explicit, Some(hook)).await?;
        self.set_state(LifecycleState::SessionActive);
        Ok(())
    }

    /// Run `op` until it succeeds or `rule` says to give up
    async fn retry<F, Fut>(
        &self,
        phase: &'static str,
        rule: RetryRule,
        cancel: &CancellationToken,
        mut op: F,
    ) -> AgentResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AgentResult<()>>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled(phase));
            }

            let err = match op().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !rule.enabled || matches!(err, AgentError::Cancelled(_)) {
                return Err(err);
            }

            self.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                phase,
                error = %err,
                retryable = err.is_retryable(),
                retry_in_secs = rule.interval_secs,
                "Attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled(phase)),
                _ = tokio::time::sleep(rule.interval()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityStore;
    use crate::storage::MemoryStorage;
    use crate::testing::{MockHttp, MockTransport};
    use serde_json::json;
    use shared::types::Topics;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Fixture {
        http: Arc<MockHttp>,
        transport: Arc<MockTransport>,
        identity: Arc<Mutex<DeviceIdentity>>,
        controller: Arc<LifecycleController>,
    }

    fn fixture(identity: DeviceIdentity, policy: RetryPolicy) -> Fixture {
        let http = Arc::new(MockHttp::new());
        let transport = Arc::new(MockTransport::new());
        let store = IdentityStore::new(Arc::new(MemoryStorage::new()));
        let credentials = Arc::new(CredentialClient::new(http.clone(), &Topics::default(), store));
        let session = Arc::new(SessionManager::new(transport.clone(), Duration::from_secs(30)));
        let identity = Arc::new(Mutex::new(identity));
        let controller = Arc::new(LifecycleController::new(
            Arc::clone(&identity),
            credentials,
            session,
            policy,
        ));
        Fixture { http, transport, identity, controller }
    }

    fn unregistered() -> DeviceIdentity {
        DeviceIdentity::new("pk-lamp", "lamp", "1.0.0")
    }

    fn with_session() -> DeviceIdentity {
        DeviceIdentity {
            id: 42,
            secret: "abc".into(),
            token: vec![1],
            access: "tcp://old:1883".into(),
            ..unregistered()
        }
    }

    fn relogin_every(secs: u64) -> RetryPolicy {
        RetryPolicy {
            relogin: RetryRule::enabled(secs),
            ..RetryPolicy::default()
        }
    }

    fn login_ok() -> serde_json::Value {
        json!({"status": 0, "data": {"accessToken": "817aecf0", "accessAddr": "tcp://broker:1883"}})
    }

    fn login_denied() -> serde_json::Value {
        json!({"status": 9, "message": "token service down"})
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_init_full_lifecycle() {
        let f = fixture(unregistered(), RetryPolicy::default());
        let topics = Topics::default();
        f.http.respond_json(&topics.register, json!({"status": 0, "data": {"id": 42, "secret": "abc"}}));
        f.http.respond_json(&topics.login, login_ok());

        assert_eq!(f.controller.state(), LifecycleState::Unconnected);
        f.controller.auto_init(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.controller.state(), LifecycleState::Operational);
        let descriptor = f.transport.last_descriptor().unwrap();
        assert_eq!(descriptor.broker, "tcp://broker:1883");
        assert_eq!(descriptor.client_id, "42");
        assert_eq!(descriptor.password, "817aecf0");
        assert_eq!(f.identity.lock().await.id, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_init_is_noop_with_live_session() {
        let f = fixture(with_session(), RetryPolicy::default());
        f.transport.set_live(true);

        f.controller.auto_init(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.http.requests().len(), 0);
        assert_eq!(f.transport.connect_count(), 0);
        assert_eq!(f.controller.state(), LifecycleState::Operational);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relogin_disabled_fails_without_sleeping() {
        let f = fixture(with_session(), RetryPolicy::default());
        f.http.respond_json(&Topics::default().login, login_denied());

        let start = Instant::now();
        let err = f.controller.auto_init(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.category(), "authentication");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(f.controller.retries(), 0);
        assert_eq!(f.transport.connect_count(), 0);
        assert_eq!(f.controller.state(), LifecycleState::Unconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relogin_sleeps_once_per_failure() {
        let f = fixture(with_session(), relogin_every(5));
        let login = Topics::default().login;
        f.http.respond_json(&login, login_denied());
        f.http.respond_json(&login, login_denied());
        f.http.respond_json(&login, login_ok());

        let start = Instant::now();
        f.controller.auto_init(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.controller.retries(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(f.http.call_count(&login), 3);
        assert_eq!(f.controller.state(), LifecycleState::Operational);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_failure_stops_before_login() {
        let f = fixture(unregistered(), RetryPolicy::default());
        let topics = Topics::default();
        f.http.respond_json(&topics.register, json!({"status": 4, "message": "quota"}));

        let err = f.controller.auto_init(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.category(), "registration");
        assert_eq!(f.http.call_count(&topics.register), 1);
        assert_eq!(f.http.call_count(&topics.login), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_rule_retries_registration_only() {
        let policy = RetryPolicy {
            reregister: RetryRule::enabled(3),
            ..RetryPolicy::default()
        };
        let f = fixture(unregistered(), policy);
        let topics = Topics::default();
        f.http.respond_json(&topics.register, json!({"status": 4, "message": "busy"}));
        f.http.respond_json(&topics.register, json!({"status": 0, "data": {"id": 5, "secret": "s"}}));
        f.http.respond_json(&topics.login, login_ok());

        let start = Instant::now();
        f.controller.auto_init(&CancellationToken::new()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(f.http.call_count(&topics.register), 2);
        assert_eq!(f.http.call_count(&topics.login), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_retry_uses_its_own_interval() {
        let policy = RetryPolicy {
            reinit_session: RetryRule::enabled(7),
            ..RetryPolicy::default()
        };
        let f = fixture(with_session(), policy);
        f.http.respond_json(&Topics::default().login, login_ok());
        f.transport.fail_connects(1);

        let start = Instant::now();
        f.controller.auto_init(&CancellationToken::new()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(f.transport.connect_count(), 2);
        // Login is not repeated for a session retry
        assert_eq!(f.http.call_count(&Topics::default().login), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_without_retry_is_returned() {
        let f = fixture(with_session(), RetryPolicy::default());
        f.http.respond_json(&Topics::default().login, login_ok());
        f.transport.fail_connects(1);

        let err = f.controller.auto_init(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.category(), "session");
        assert_eq!(f.controller.state(), LifecycleState::Unconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_retry_sleep() {
        let f = fixture(with_session(), relogin_every(60));
        for _ in 0..10 {
            f.http.respond_json(&Topics::default().login, login_denied());
        }

        let cancel = CancellationToken::new();
        let controller = Arc::clone(&f.controller);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { controller.auto_init(&token).await });

        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Cancelled("login")));
        assert_eq!(f.http.call_count(&Topics::default().login), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_hook_logs_in_again() {
        let f = fixture(with_session(), RetryPolicy::default());
        let login = Topics::default().login;
        f.http.respond_json(&login, login_ok());
        f.http.respond_json(
            &login,
            json!({"status": 0, "data": {"accessToken": "0a0b", "accessAddr": "tcp://broker:1883"}}),
        );

        f.controller.auto_init(&CancellationToken::new()).await.unwrap();

        let hook = f.transport.last_descriptor().unwrap().reconnect.unwrap();
        assert_eq!(hook.refresh_password().await.unwrap(), "0a0b");
        assert_eq!(f.identity.lock().await.token, vec![0x0a, 0x0b]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_follows_reregister_rule() {
        let policy = RetryPolicy {
            reregister: RetryRule::enabled(4),
            ..RetryPolicy::default()
        };
        let f = fixture(unregistered(), policy);
        let register = Topics::default().register;
        f.http.respond_json(&register, json!({"status": 4, "message": "busy"}));
        f.http.respond_json(&register, json!({"status": 4, "message": "busy"}));
        f.http.respond_json(&register, json!({"status": 0, "data": {"id": 9, "secret": "s"}}));

        let start = Instant::now();
        f.controller.register(&CancellationToken::new()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(8));
        assert_eq!(f.controller.retries(), 2);
        assert_eq!(f.identity.lock().await.id, 9);
        // Credentials only, no session
        assert_eq!(f.transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_follows_relogin_rule_without_opening_session() {
        let f = fixture(with_session(), relogin_every(5));
        let login = Topics::default().login;
        f.http.respond_json(&login, login_denied());
        f.http.respond_json(&login, login_ok());

        let start = Instant::now();
        f.controller.login(&CancellationToken::new()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(f.http.call_count(&login), 2);
        assert_eq!(f.identity.lock().await.access, "tcp://broker:1883");
        assert_eq!(f.transport.connect_count(), 0);
        assert_eq!(f.controller.state(), LifecycleState::Unconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_without_retry_returns_first_failure() {
        let f = fixture(with_session(), RetryPolicy::default());
        f.http.respond_json(&Topics::default().login, login_denied());

        let start = Instant::now();
        let err = f.controller.login(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.category(), "authentication");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(f.controller.retries(), 0);
    }
}
