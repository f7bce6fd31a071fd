//! Which subscriptions keep a dialog alive
//!
//! A dialog shared with subscriptions must survive a BYE until the last of
//! them is gone. The counts live here, keyed by dialog id, rather than on the
//! dialog object. Every operation locks only the record of its own dialog.

use crate::domain::shared::{DialogId, SubscriptionId};
use crate::infrastructure::protocols::sip::dialog::Dialog;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Dialog {0} is already terminated")]
    DialogUnusable(DialogId),
}

#[derive(Debug, Default)]
struct DialogRecord {
    bye_processed: bool,
    subscriptions: HashSet<SubscriptionId>,
    /// Unlinked from the ledger; a racing caller must look again
    retired: bool,
}

#[derive(Debug, Default)]
pub struct DialogSubscriptionLedger {
    records: DashMap<DialogId, Arc<Mutex<DialogRecord>>>,
}

impl DialogSubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, dialog: &DialogId) -> Option<Arc<Mutex<DialogRecord>>> {
        self.records.get(dialog).map(|r| r.value().clone())
    }

    fn unlink(&self, dialog: &DialogId, record: &Arc<Mutex<DialogRecord>>) {
        self.records
            .remove_if(dialog, |_, current| Arc::ptr_eq(current, record));
    }

    /// Attach `subscription` to `dialog`
    ///
    /// Returns false if it was already attached. Fails, leaving no trace,
    /// when the dialog has already terminated.
    pub fn attach(&self, dialog: &Dialog, subscription: SubscriptionId) -> Result<bool, LedgerError> {
        loop {
            let record = self
                .records
                .entry(dialog.id().clone())
                .or_default()
                .value()
                .clone();
            let mut guard = record.lock();
            if guard.retired {
                continue;
            }

            if !guard.subscriptions.insert(subscription) {
                return Ok(false);
            }

            if !dialog.suppress_auto_termination() {
                guard.subscriptions.remove(&subscription);
                if guard.subscriptions.is_empty() {
                    guard.retired = true;
                    self.unlink(dialog.id(), &record);
                }
                return Err(LedgerError::DialogUnusable(dialog.id().clone()));
            }

            debug!(
                "Subscription {} attached to dialog {} ({} attached)",
                subscription,
                dialog.id(),
                guard.subscriptions.len()
            );
            return Ok(true);
        }
    }

    pub fn is_bye_processed(&self, dialog: &DialogId) -> bool {
        self.record(dialog)
            .map(|r| r.lock().bye_processed)
            .unwrap_or(false)
    }

    pub fn has_subscriptions(&self, dialog: &DialogId) -> bool {
        self.record(dialog)
            .map(|r| !r.lock().subscriptions.is_empty())
            .unwrap_or(false)
    }

    /// A BYE arrived on `dialog`. Returns true if subscriptions keep it alive;
    /// false means the caller proceeds with teardown.
    pub fn on_bye_received(&self, dialog: &Dialog) -> bool {
        let Some(record) = self.record(dialog.id()) else {
            return false;
        };
        let mut guard = record.lock();
        if guard.retired {
            return false;
        }

        guard.bye_processed = true;
        if guard.subscriptions.is_empty() {
            guard.retired = true;
            self.unlink(dialog.id(), &record);
            return false;
        }

        dialog.suppress_auto_termination();
        debug!(
            "BYE on dialog {} deferred, {} subscriptions attached",
            dialog.id(),
            guard.subscriptions.len()
        );
        true
    }

    /// Detach `subscription` from `dialog`. Returns false when this was the
    /// last subscription after a BYE, in which case the dialog is terminated.
    pub fn detach(&self, dialog: &Dialog, subscription: SubscriptionId) -> bool {
        let Some(record) = self.record(dialog.id()) else {
            return true;
        };
        let mut guard = record.lock();
        if guard.retired {
            return true;
        }

        guard.subscriptions.remove(&subscription);
        if !guard.subscriptions.is_empty() {
            return true;
        }

        guard.retired = true;
        self.unlink(dialog.id(), &record);

        if guard.bye_processed {
            debug!("Last subscription left dialog {} after BYE, terminating", dialog.id());
            dialog.terminate();
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::dialog::tests::test_dialog;

    #[test]
    fn test_dialog_survives_bye_until_last_detach() {
        let ledger = DialogSubscriptionLedger::new();
        let dialog = test_dialog("ledger1@host");
        let s1 = SubscriptionId::new();
        let s2 = SubscriptionId::new();

        assert_eq!(ledger.attach(&dialog, s1), Ok(true));
        assert_eq!(ledger.attach(&dialog, s2), Ok(true));
        assert!(!dialog.auto_terminates_on_bye());

        assert!(ledger.on_bye_received(&dialog));
        assert!(ledger.is_bye_processed(dialog.id()));

        assert!(ledger.detach(&dialog, s1));
        assert!(!dialog.is_terminated());

        assert!(!ledger.detach(&dialog, s2));
        assert!(dialog.is_terminated());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_attach_is_idempotent() {
        let ledger = DialogSubscriptionLedger::new();
        let dialog = test_dialog("ledger2@host");
        let s1 = SubscriptionId::new();

        assert_eq!(ledger.attach(&dialog, s1), Ok(true));
        assert_eq!(ledger.attach(&dialog, s1), Ok(false));
        assert!(ledger.detach(&dialog, s1));
        assert!(!dialog.is_terminated());
        assert!(!ledger.has_subscriptions(dialog.id()));
    }

    #[test]
    fn test_attach_to_terminated_dialog_rolls_back() {
        let ledger = DialogSubscriptionLedger::new();
        let dialog = test_dialog("ledger3@host");
        dialog.terminate();

        assert_eq!(
            ledger.attach(&dialog, SubscriptionId::new()),
            Err(LedgerError::DialogUnusable(dialog.id().clone()))
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_bye_without_subscriptions_allows_teardown() {
        let ledger = DialogSubscriptionLedger::new();
        let dialog = test_dialog("ledger4@host");
        assert!(!ledger.on_bye_received(&dialog));
        assert!(!ledger.is_bye_processed(dialog.id()));
    }

    #[test]
    fn test_concurrent_attach_detach_per_dialog() {
        let ledger = Arc::new(DialogSubscriptionLedger::new());
        let dialog = test_dialog("ledger5@host");

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let dialog = dialog.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let id = SubscriptionId::new();
                        assert_eq!(ledger.attach(&dialog, id), Ok(true));
                        assert!(ledger.detach(&dialog, id));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(!ledger.has_subscriptions(dialog.id()));
        assert!(!dialog.is_terminated());
    }
}
