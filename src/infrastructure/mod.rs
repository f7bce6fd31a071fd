//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP stack and the subscription/keep-alive machinery on top of it
//! - The per-account timer scheduler
//! - Metric recording

pub mod metrics;
pub mod protocols;
pub mod scheduler;
