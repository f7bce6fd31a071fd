//! Domain layer - Core rules of the user agent
//!
//! This layer contains:
//! - Value Objects: addresses, Call-IDs, dialog and subscription ids
//! - Registration state and the connectivity signal
//! - Event package subscriptions and their handlers
//! - Message summary bodies (RFC 3842)

pub mod mwi;
pub mod registration;
pub mod shared;
pub mod subscription;

// Re-export commonly used types
pub use shared::{DomainError, Result};
