//! RFC 3265 subscriptions on the client side
//!
//! - `registry`: live subscriptions of one package, by key and by Call-ID
//! - `ledger`: which subscriptions keep which dialog alive past a BYE
//! - `engine`: the SUBSCRIBE/NOTIFY exchange itself

pub mod engine;
pub mod ledger;
pub mod registry;

pub use engine::{
    refresh_delay, EngineContext, SubscriptionConfig, SubscriptionEngine, SubscriptionError,
};
pub use ledger::{DialogSubscriptionLedger, LedgerError};
pub use registry::{SubscriptionKey, SubscriptionRegistry, TrackedSubscription};
