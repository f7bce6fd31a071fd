//! Registration state and connectivity signalling
//!
//! The registrar connection itself lives outside this crate. What lives here is
//! the state it reports, and the single signal through which the watchdog and
//! the subscription engines report a dead connection back to it.

use super::shared::{DomainEvent, EventMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{info, warn};

/// Account registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Init,
    Registering,
    Registered,
    Unregistering,
    Unregistered,
    AuthenticationFailed,
    ConnectionFailed,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Init => "INIT",
            RegistrationState::Registering => "REGISTERING",
            RegistrationState::Registered => "REGISTERED",
            RegistrationState::Unregistering => "UNREGISTERING",
            RegistrationState::Unregistered => "UNREGISTERED",
            RegistrationState::AuthenticationFailed => "AUTHENTICATION_FAILED",
            RegistrationState::ConnectionFailed => "CONNECTION_FAILED",
        }
    }

    /// States that end a registration session (and any watchdog bound to it)
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            RegistrationState::Unregistering
                | RegistrationState::Unregistered
                | RegistrationState::AuthenticationFailed
                | RegistrationState::ConnectionFailed
        )
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registration state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationStateChanged {
    pub metadata: EventMetadata,
    pub old_state: RegistrationState,
    pub new_state: RegistrationState,
    pub reason: Option<String>,
}

impl DomainEvent for RegistrationStateChanged {
    fn event_type(&self) -> &'static str {
        "RegistrationStateChanged"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}

/// Provider-level connectivity signal
///
/// Called on unrecoverable transport failures (transaction timeouts, I/O
/// errors, dead keep-alives). Whoever implements it owns the reconnect policy.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectivitySignal: Send + Sync {
    fn notify_connection_failed(&self);
}

/// Current registration state, observable through a watch channel
pub struct RegistrationStatus {
    tx: watch::Sender<RegistrationStateChanged>,
}

impl RegistrationStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RegistrationStateChanged {
            metadata: EventMetadata::new(),
            old_state: RegistrationState::Init,
            new_state: RegistrationState::Init,
            reason: None,
        });
        Self { tx }
    }

    pub fn state(&self) -> RegistrationState {
        self.tx.borrow().new_state
    }

    /// Move to `new_state`. Returns false if already there.
    pub fn set_state(&self, new_state: RegistrationState, reason: Option<String>) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if current.new_state == new_state {
                return false;
            }
            *current = RegistrationStateChanged {
                metadata: EventMetadata::new(),
                old_state: current.new_state,
                new_state,
                reason: reason.clone(),
            };
            true
        });

        if changed {
            info!(
                "Registration state changed to {} ({})",
                new_state,
                reason.as_deref().unwrap_or("no reason")
            );
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationStateChanged> {
        self.tx.subscribe()
    }
}

impl Default for RegistrationStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivitySignal for RegistrationStatus {
    fn notify_connection_failed(&self) {
        let state = self.state();
        if matches!(
            state,
            RegistrationState::Registered | RegistrationState::Registering
        ) {
            self.set_state(
                RegistrationState::ConnectionFailed,
                Some("connection to the server lost".to_string()),
            );
        } else {
            warn!("Connection failure reported while {}, ignoring", state);
        }
    }
}
