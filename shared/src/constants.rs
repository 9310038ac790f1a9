//! # Constants for the IoT Device Agent
//!
//! Platform endpoints, default topics, retry intervals and the names of
//! the environment variables understood by [`crate::config::AgentConfig`].

// =============================================================================
// PLATFORM ENDPOINTS
// =============================================================================

/// Default base URL of the platform's REST API
pub const DEFAULT_PLATFORM_URL: &str = "http://127.0.0.1:8080";

/// Path of the device registration endpoint
pub const REGISTER_PATH: &str = "/v1/devices/registration";

/// Path of the device authentication (login) endpoint
pub const LOGIN_PATH: &str = "/v1/devices/authentication";

/// Content type of every request sent to the platform
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Value of the `status` field the platform uses to signal success.
/// Anything else is a business failure, even inside an HTTP 200 body.
pub const PLATFORM_STATUS_OK: i32 = 0;

/// HTTP request timeout (seconds)
pub const HTTP_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// MESSAGING TOPICS
// =============================================================================

/// Topic for outbound property reports
pub const TOPIC_POST_PROPERTY: &str = "s/1";

/// Topic for outbound event reports
pub const TOPIC_POST_EVENT: &str = "s/2";

/// Topic carrying inbound commands
pub const TOPIC_ON_COMMAND: &str = "c/1";

/// QoS used for property/event reports and the command subscription
pub const TELEMETRY_QOS: u8 = 1;

// =============================================================================
// SESSION
// =============================================================================

/// Keep-alive interval of the messaging session (seconds)
pub const SESSION_KEEP_ALIVE_SECS: u64 = 30;

/// Capacity of the MQTT request channel
pub const MQTT_CHANNEL_CAPACITY: usize = 64;

/// Port used when the session endpoint does not name one
pub const MQTT_DEFAULT_PORT: u16 = 1883;

/// Parameter key under which a command's sub-device id is delivered
pub const SUB_DEVICE_PARAM_KEY: i32 = -1;

// =============================================================================
// RETRY
// =============================================================================

/// Default pause between two registration attempts (seconds)
pub const REREGISTER_INTERVAL_SECS: u64 = 5;

/// Default pause between two login attempts (seconds)
pub const RELOGIN_INTERVAL_SECS: u64 = 5;

/// Default pause between two session initialisation attempts (seconds)
pub const REINIT_SESSION_INTERVAL_SECS: u64 = 5;

// =============================================================================
// STORAGE
// =============================================================================

/// Default directory of the file-backed storage
pub const DEFAULT_DATA_PATH: &str = "./device_storage";

/// File name of the key/value document inside the data directory
pub const STORAGE_FILE_NAME: &str = "device.json";

/// Per-field storage key suffixes, appended to `<device name>.`
pub const KEY_PRODUCT_KEY: &str = "ProductKey";
pub const KEY_NAME: &str = "Name";
pub const KEY_SECRET: &str = "Secret";
pub const KEY_VERSION: &str = "Version";
pub const KEY_ID: &str = "ID";
pub const KEY_ACCESS: &str = "Access";
pub const KEY_TOKEN: &str = "Token";

// =============================================================================
// ENVIRONMENT VARIABLE NAMES
// =============================================================================

/// Product key of the device
pub const ENV_PRODUCT_KEY: &str = "IOT_PRODUCT_KEY";

/// Logical device name
pub const ENV_DEVICE_NAME: &str = "IOT_DEVICE_NAME";

/// Firmware version reported at registration
pub const ENV_DEVICE_VERSION: &str = "IOT_DEVICE_VERSION";

/// Base URL of the platform REST API
pub const ENV_PLATFORM_URL: &str = "IOT_PLATFORM_URL";

/// Directory of the file-backed storage
pub const ENV_DATA_PATH: &str = "IOT_DATA_PATH";

/// Enables every retry rule when set to a truthy value
pub const ENV_AUTO_RETRY: &str = "IOT_AUTO_RETRY";

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Build the storage key of `field` for the device called `name`
pub fn storage_key(name: &str, field: &str) -> String {
    format!("{}.{}", name, field)
}

/// Interpret an environment flag value
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
