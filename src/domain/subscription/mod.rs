//! Event package subscriptions (RFC 3265)
//!
//! A `Subscription` is what the application hands to the subscription engine:
//! who to subscribe to, under which event id, and what to do with the
//! outcome. The engine owns the signaling; the subscription only reacts.

pub mod packages;

pub use packages::{
    DialogInfoSubscription, MessageWaitingSubscription, PresenceSubscription,
    SubscriptionEvent, SubscriptionEventKind,
};

use super::shared::SipAddress;
use std::fmt;

/// An RFC 3265 event package and the body type its NOTIFYs carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventPackage {
    /// Event header token
    pub name: &'static str,
    /// Sub-type of `application/...` accepted in NOTIFY bodies
    pub content_sub_type: &'static str,
}

impl EventPackage {
    /// RFC 3856 presence
    pub const PRESENCE: EventPackage = EventPackage {
        name: "presence",
        content_sub_type: "pidf+xml",
    };

    /// RFC 4235 dialog event package
    pub const DIALOG: EventPackage = EventPackage {
        name: "dialog",
        content_sub_type: "dialog-info+xml",
    };

    /// RFC 3842 message waiting indication
    pub const MESSAGE_SUMMARY: EventPackage = EventPackage {
        name: "message-summary",
        content_sub_type: "simple-message-summary",
    };

    pub fn by_name(name: &str) -> Option<EventPackage> {
        [Self::PRESENCE, Self::DIALOG, Self::MESSAGE_SUMMARY]
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Accept header value
    pub fn accept(&self) -> String {
        format!("application/{}", self.content_sub_type)
    }
}

impl fmt::Display for EventPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One subscription of one event package
///
/// Hooks are invoked from the network and timer tasks; implementations must
/// not block.
pub trait Subscription: Send + Sync + fmt::Debug {
    fn package(&self) -> EventPackage;

    /// Target of the SUBSCRIBE
    fn address(&self) -> &SipAddress;

    /// `id` parameter of the Event header
    fn event_id(&self) -> Option<&str>;

    /// A NOTIFY with a non-terminated state arrived
    fn on_active_notify(&self, body: &[u8]);

    /// A SUBSCRIBE (initial or refresh) was accepted
    fn on_success(&self, status_code: u16);

    /// The subscription failed with `status_code` and is no longer tracked
    fn on_failure(&self, status_code: u16);

    /// The notifier terminated the subscription
    fn on_terminated(&self, reason: Option<&str>);
}
