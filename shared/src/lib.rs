//! # Shared Module for the IoT Device Agent
//!
//! This crate provides the types, configuration, constants and errors
//! used by the device agent and its collaborators.
//!
//! ## Identity fields
//!
//! | Field | Issued by | Meaning when empty |
//! |-------|-----------|--------------------|
//! | `id`, `secret` | registration | device never registered |
//! | `token`, `access` | login | no valid session |

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::*;
pub use constants::*;
pub use error::*;
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
