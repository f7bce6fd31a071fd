//! Shared kernel - Common types used by the subscription and registration contexts

pub mod error;
pub mod events;
pub mod value_objects;

pub use error::{DomainError, Result};
pub use events::{DomainEvent, EventMetadata};
pub use value_objects::*;
