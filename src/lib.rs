//! YakUA - The signaling core of a SIP user agent, built with Rust
//!
//! This is a Domain-Driven Design (DDD) implementation of the parts of a SIP
//! user agent that keep a registration alive and track RFC 3265 event
//! subscriptions (presence, dialog-event, message-summary) over their whole
//! lifecycle.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::Result;
