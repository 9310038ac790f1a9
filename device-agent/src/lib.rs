//! # IoT Device Agent
//!
//! Client-side agent for connected devices:
//! - Registration and login against the platform REST API
//! - Persistent device identity
//! - Authenticated MQTT session with token refresh on reconnect
//! - Property reports, event reports and command dispatch
//! - Automatic bring-up with configurable retries
//!
//! ## Bring-up
//!
//! ```text
//! load identity ─▶ register (if never registered) ─▶ login ─▶ open session
//! ```
//!
//! Every external capability sits behind a trait ([`Storage`],
//! [`HttpClient`], [`Transport`], [`Serializer`]) so it can be swapped when
//! building the [`Device`].

pub mod device;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod messaging;
pub mod registration;
pub mod serializer;
pub mod session;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use device::{Device, DeviceBuilder};
pub use http::{HttpClient, ReqwestHttpClient};
pub use identity::IdentityStore;
pub use lifecycle::{LifecycleController, LifecycleState};
pub use messaging::{CommandTable, MessagingFacade};
pub use registration::CredentialClient;
pub use serializer::{JsonSerializer, Serializer};
pub use session::{Request, SessionManager};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transport::{MqttTransport, SessionDescriptor, Transport};
