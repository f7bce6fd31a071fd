//! SIP signaling for a user agent
//!
//! Layering, bottom up:
//! ```text
//! ┌──────────────────────────────────────┐
//! │  Subscriptions / Watchdog            │
//! │  (SUBSCRIBE-NOTIFY, keep-alive)      │
//! └──────────────────┬───────────────────┘
//!                    │
//! ┌──────────────────▼───────────────────┐
//! │  Dialog Layer (UAC dialogs)          │
//! └──────────────────┬───────────────────┘
//!                    │
//! ┌──────────────────▼───────────────────┐
//! │  Transaction Layer (non-INVITE UAC)  │
//! └──────────────────┬───────────────────┘
//!                    │
//! ┌──────────────────▼───────────────────┐
//! │  Transport Layer (UDP)               │
//! └──────────────────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod handler;
pub mod headers;
pub mod message;
pub mod stack;
pub mod subscription;
pub mod transaction;
pub mod transport;
pub mod watchdog;

pub use auth::{AuthChallenge, ChallengeHandler, DigestChallengeHandler, UserCredentials};
pub use builder::{AccountMessageFactory, MessageFactory, ResponseBuilder};
pub use dialog::{Dialog, DialogState, DialogTable};
pub use handler::{IoErrorEvent, RequestEvent, ResponseEvent, SipListener, TimeoutEvent};
pub use headers::HeaderBag;
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use stack::{SipStack, SipStackConfig};
pub use subscription::{
    DialogSubscriptionLedger, EngineContext, SubscriptionConfig, SubscriptionEngine,
    SubscriptionError,
};
pub use transaction::{ClientTransaction, SipTimers, TransactionEngine, TransactionId};
pub use transport::{UdpSender, UdpTransport};
pub use watchdog::{KeepAliveMethod, RegistrationWatchdog, WatchdogConfig};
