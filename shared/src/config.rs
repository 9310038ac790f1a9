//! # Configuration for the IoT Device Agent
//!
//! This module handles configuration loading and validation,
//! supporting environment variables and TOML configuration files.

use crate::constants::*;
use crate::error::{AgentError, AgentResult};
use crate::types::Topics;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// AGENT CONFIGURATION
// =============================================================================

/// Top-level configuration of the device agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Device identity seed
    pub device: DeviceConfig,

    /// Platform REST API
    pub platform: PlatformConfig,

    /// Messaging topics
    pub topics: TopicConfig,

    /// Retry policy of the lifecycle controller
    pub retry: RetryPolicy,

    /// Messaging session
    pub session: SessionConfig,

    /// Local storage
    pub storage: StorageConfig,

    /// HTTP client
    pub http: HttpConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AgentError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> AgentResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Override fields with any environment variables that are set
    pub fn apply_env(&mut self) {
        if let Ok(product_key) = env::var(ENV_PRODUCT_KEY) {
            self.device.product_key = product_key;
        }
        if let Ok(name) = env::var(ENV_DEVICE_NAME) {
            self.device.name = name;
        }
        if let Ok(version) = env::var(ENV_DEVICE_VERSION) {
            self.device.version = version;
        }
        if let Ok(url) = env::var(ENV_PLATFORM_URL) {
            self.platform.base_url = url;
        }
        if let Ok(path) = env::var(ENV_DATA_PATH) {
            self.storage.data_path = PathBuf::from(path);
        }
        if let Ok(flag) = env::var(ENV_AUTO_RETRY) {
            if is_truthy(&flag) {
                self.retry = self.retry.clone().enable_all();
            }
        }
    }

    /// Resolve the topic table from the platform and topic sections
    pub fn topics(&self) -> Topics {
        Topics {
            register: self.platform.register_url(),
            login: self.platform.login_url(),
            post_property: self.topics.post_property.clone(),
            post_event: self.topics.post_event.clone(),
            on_command: self.topics.on_command.clone(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> AgentResult<()> {
        self.device.validate()?;
        self.platform.validate()?;
        self.topics.validate()?;
        self.session.validate()?;
        Ok(())
    }
}

// =============================================================================
// DEVICE CONFIGURATION
// =============================================================================

/// Provisioning-time identity of the device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Product classifier assigned by the platform
    pub product_key: String,

    /// Logical device name, also the storage namespace
    pub name: String,

    /// Firmware/software version
    pub version: String,
}

impl DeviceConfig {
    fn validate(&self) -> AgentResult<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::ConfigurationError(
                "device name must not be empty".into(),
            ));
        }
        if self.name.contains('.') {
            return Err(AgentError::ConfigurationError(format!(
                "device name '{}' must not contain '.'",
                self.name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// PLATFORM CONFIGURATION
// =============================================================================

/// Where the registration and login endpoints live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Base URL of the REST API
    pub base_url: String,

    /// Path of the registration endpoint
    pub register_path: String,

    /// Path of the login endpoint
    pub login_path: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PLATFORM_URL.into(),
            register_path: REGISTER_PATH.into(),
            login_path: LOGIN_PATH.into(),
        }
    }
}

impl PlatformConfig {
    /// Full URL of the registration endpoint
    pub fn register_url(&self) -> String {
        join_url(&self.base_url, &self.register_path)
    }

    /// Full URL of the login endpoint
    pub fn login_url(&self) -> String {
        join_url(&self.base_url, &self.login_path)
    }

    fn validate(&self) -> AgentResult<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(AgentError::ConfigurationError(format!(
                "platform url '{}' must start with http:// or https://",
                self.base_url
            )));
        }
        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// =============================================================================
// TOPIC CONFIGURATION
// =============================================================================

/// Messaging topics of the three application message shapes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub post_property: String,
    pub post_event: String,
    pub on_command: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            post_property: TOPIC_POST_PROPERTY.into(),
            post_event: TOPIC_POST_EVENT.into(),
            on_command: TOPIC_ON_COMMAND.into(),
        }
    }
}

impl TopicConfig {
    fn validate(&self) -> AgentResult<()> {
        for (label, topic) in [
            ("post_property", &self.post_property),
            ("post_event", &self.post_event),
            ("on_command", &self.on_command),
        ] {
            if topic.is_empty() {
                return Err(AgentError::ConfigurationError(format!(
                    "topic '{}' must not be empty",
                    label
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// One retry rule: whether to retry, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRule {
    /// Retry until success when set, fail on the first error otherwise
    pub enabled: bool,

    /// Pause between two attempts in seconds
    pub interval_secs: u64,
}

impl RetryRule {
    /// A disabled rule with the given interval
    pub const fn disabled(interval_secs: u64) -> Self {
        Self {
            enabled: false,
            interval_secs,
        }
    }

    /// An enabled rule with the given interval
    pub const fn enabled(interval_secs: u64) -> Self {
        Self {
            enabled: true,
            interval_secs,
        }
    }

    /// Pause between two attempts
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Retry policy of the lifecycle controller.
///
/// Built once and handed to the controller at construction; the three
/// rules are independent of each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Registration retries
    pub reregister: RetryRule,

    /// Login retries
    pub relogin: RetryRule,

    /// Session initialisation retries
    pub reinit_session: RetryRule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reregister: RetryRule::disabled(REREGISTER_INTERVAL_SECS),
            relogin: RetryRule::disabled(RELOGIN_INTERVAL_SECS),
            reinit_session: RetryRule::disabled(REINIT_SESSION_INTERVAL_SECS),
        }
    }
}

impl RetryPolicy {
    /// Same intervals, every rule enabled
    pub fn enable_all(mut self) -> Self {
        self.reregister.enabled = true;
        self.relogin.enabled = true;
        self.reinit_session.enabled = true;
        self
    }
}

// =============================================================================
// SESSION CONFIGURATION
// =============================================================================

/// Messaging session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,

    /// Capacity of the MQTT request channel
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: SESSION_KEEP_ALIVE_SECS,
            channel_capacity: MQTT_CHANNEL_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Keep-alive interval
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    fn validate(&self) -> AgentResult<()> {
        // MQTT keep-alive below 5 seconds is rejected by most brokers
        if self.keep_alive_secs < 5 {
            return Err(AgentError::ConfigurationError(format!(
                "keep-alive of {}s is too short",
                self.keep_alive_secs
            )));
        }
        if self.channel_capacity == 0 {
            return Err(AgentError::ConfigurationError(
                "channel capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// STORAGE CONFIGURATION
// =============================================================================

/// File-backed storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the key/value document
    pub data_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
        }
    }
}

impl StorageConfig {
    /// Path of the key/value document
    pub fn file_path(&self) -> PathBuf {
        self.data_path.join(STORAGE_FILE_NAME)
    }
}

// =============================================================================
// HTTP CONFIGURATION
// =============================================================================

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: HTTP_TIMEOUT_SECS,
        }
    }
}

impl HttpConfig {
    /// Request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
