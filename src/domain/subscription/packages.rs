//! Presence, dialog-event and message-summary subscriptions
//!
//! Each forwards its hook invocations to the application as
//! `SubscriptionEvent`s on an unbounded channel.

use super::{EventPackage, Subscription};
use crate::domain::mwi::MessageSummary;
use crate::domain::shared::SipAddress;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEventKind {
    Accepted { status_code: u16 },
    Active { body: Vec<u8> },
    MessageSummary(MessageSummary),
    Failed { status_code: u16 },
    Terminated { reason: Option<String> },
}

/// Something happened to one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub package: EventPackage,
    pub address: SipAddress,
    pub event_id: Option<String>,
    pub kind: SubscriptionEventKind,
}

#[derive(Debug)]
struct Forwarder {
    package: EventPackage,
    address: SipAddress,
    event_id: Option<String>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl Forwarder {
    fn emit(&self, kind: SubscriptionEventKind) {
        let event = SubscriptionEvent {
            package: self.package,
            address: self.address.clone(),
            event_id: self.event_id.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            debug!("No receiver for {} events of {}", self.package, self.address);
        }
    }
}

macro_rules! forwarding_subscription {
    ($name:ident, $package:expr) => {
        #[derive(Debug)]
        pub struct $name {
            inner: Forwarder,
        }

        impl $name {
            pub fn new(
                address: SipAddress,
                event_id: Option<String>,
                events: mpsc::UnboundedSender<SubscriptionEvent>,
            ) -> Self {
                Self {
                    inner: Forwarder {
                        package: $package,
                        address,
                        event_id,
                        events,
                    },
                }
            }
        }
    };
}

forwarding_subscription!(PresenceSubscription, EventPackage::PRESENCE);
forwarding_subscription!(DialogInfoSubscription, EventPackage::DIALOG);
forwarding_subscription!(MessageWaitingSubscription, EventPackage::MESSAGE_SUMMARY);

/// Hooks shared by every package that passes bodies through untouched
macro_rules! forwarding_hooks {
    ($name:ident) => {
        impl Subscription for $name {
            fn package(&self) -> EventPackage {
                self.inner.package
            }

            fn address(&self) -> &SipAddress {
                &self.inner.address
            }

            fn event_id(&self) -> Option<&str> {
                self.inner.event_id.as_deref()
            }

            fn on_active_notify(&self, body: &[u8]) {
                self.active(body);
            }

            fn on_success(&self, status_code: u16) {
                self.inner.emit(SubscriptionEventKind::Accepted { status_code });
            }

            fn on_failure(&self, status_code: u16) {
                self.inner.emit(SubscriptionEventKind::Failed { status_code });
            }

            fn on_terminated(&self, reason: Option<&str>) {
                self.inner.emit(SubscriptionEventKind::Terminated {
                    reason: reason.map(str::to_string),
                });
            }
        }
    };
}

forwarding_hooks!(PresenceSubscription);
forwarding_hooks!(DialogInfoSubscription);
forwarding_hooks!(MessageWaitingSubscription);

impl PresenceSubscription {
    fn active(&self, body: &[u8]) {
        self.inner.emit(SubscriptionEventKind::Active { body: body.to_vec() });
    }
}

impl DialogInfoSubscription {
    fn active(&self, body: &[u8]) {
        self.inner.emit(SubscriptionEventKind::Active { body: body.to_vec() });
    }
}

impl MessageWaitingSubscription {
    fn active(&self, body: &[u8]) {
        let parsed = std::str::from_utf8(body)
            .map_err(|e| e.to_string())
            .and_then(|text| MessageSummary::parse(text).map_err(|e| e.to_string()));

        match parsed {
            Ok(summary) => self.inner.emit(SubscriptionEventKind::MessageSummary(summary)),
            Err(e) => {
                // Empty NOTIFYs are legal before the first mailbox report
                if !body.is_empty() {
                    warn!("Unparseable message-summary from {}: {}", self.inner.address, e);
                }
                self.inner.emit(SubscriptionEventKind::Active { body: body.to_vec() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> SipAddress {
        SipAddress::parse("sip:bob@example.com").unwrap()
    }

    #[test]
    fn test_presence_forwards_hooks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = PresenceSubscription::new(address(), Some("7".to_string()), tx);

        assert_eq!(sub.package(), EventPackage::PRESENCE);
        assert_eq!(sub.event_id(), Some("7"));

        sub.on_success(202);
        sub.on_active_notify(b"<presence/>");
        sub.on_terminated(Some("noresource"));

        assert_eq!(
            rx.try_recv().unwrap().kind,
            SubscriptionEventKind::Accepted { status_code: 202 }
        );
        assert_eq!(
            rx.try_recv().unwrap().kind,
            SubscriptionEventKind::Active { body: b"<presence/>".to_vec() }
        );
        let terminated = rx.try_recv().unwrap();
        assert_eq!(terminated.address, address());
        assert_eq!(
            terminated.kind,
            SubscriptionEventKind::Terminated { reason: Some("noresource".to_string()) }
        );
    }

    #[test]
    fn test_message_waiting_parses_summary() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = MessageWaitingSubscription::new(address(), None, tx);

        sub.on_active_notify(b"Messages-Waiting: yes\r\nVoice-Message: 3/1\r\n");
        match rx.try_recv().unwrap().kind {
            SubscriptionEventKind::MessageSummary(summary) => {
                assert!(summary.messages_waiting);
                assert_eq!(summary.total_new(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        sub.on_active_notify(b"");
        assert_eq!(
            rx.try_recv().unwrap().kind,
            SubscriptionEventKind::Active { body: Vec::new() }
        );
    }

    #[test]
    fn test_dropped_receiver_is_tolerated() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sub = DialogInfoSubscription::new(address(), None, tx);
        sub.on_failure(404);
    }
}
