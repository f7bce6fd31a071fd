//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects and the SIP infrastructure.
//! It's responsible for:
//! - Wiring the per-account signaling components together
//! - Routing stack callbacks to the component that owns them
//! - Ordered shutdown

pub mod user_agent;

pub use user_agent::{UserAgent, UserAgentConfig};
