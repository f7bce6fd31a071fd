//! Live subscriptions of one event package

use crate::domain::shared::{CallId, SipAddress, SubscriptionId};
use crate::domain::subscription::Subscription;
use crate::infrastructure::protocols::sip::dialog::Dialog;
use crate::infrastructure::protocols::sip::transaction::TransactionId;
use crate::infrastructure::scheduler::TimerHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// `(target address, event id)` - at most one subscription per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub address: SipAddress,
    pub event_id: Option<String>,
}

impl SubscriptionKey {
    pub fn new(address: SipAddress, event_id: Option<String>) -> Self {
        Self { address, event_id }
    }

    pub fn of(subscription: &dyn Subscription) -> Self {
        Self::new(
            subscription.address().clone(),
            subscription.event_id().map(str::to_string),
        )
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event_id {
            Some(id) => write!(f, "{} (id={})", self.address.uri(), id),
            None => write!(f, "{}", self.address.uri()),
        }
    }
}

/// A subscription as tracked by the engine
pub struct TrackedSubscription {
    id: SubscriptionId,
    key: SubscriptionKey,
    handler: Arc<dyn Subscription>,
    call_id: Mutex<CallId>,
    dialog: Mutex<Option<Arc<Dialog>>>,
    refresh_timer: Mutex<Option<TimerHandle>>,
    pending: Mutex<Option<TransactionId>>,
}

impl TrackedSubscription {
    pub fn new(handler: Arc<dyn Subscription>, call_id: CallId) -> Self {
        Self {
            id: SubscriptionId::new(),
            key: SubscriptionKey::of(handler.as_ref()),
            handler,
            call_id: Mutex::new(call_id),
            dialog: Mutex::new(None),
            refresh_timer: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn handler(&self) -> &Arc<dyn Subscription> {
        &self.handler
    }

    pub fn call_id(&self) -> CallId {
        self.call_id.lock().clone()
    }

    fn set_call_id(&self, call_id: CallId) {
        *self.call_id.lock() = call_id;
    }

    pub fn dialog(&self) -> Option<Arc<Dialog>> {
        self.dialog.lock().clone()
    }

    /// The owning dialog unless it has terminated
    pub fn live_dialog(&self) -> Option<Arc<Dialog>> {
        self.dialog().filter(|d| !d.is_terminated())
    }

    /// Bind to `dialog`, returning the previous one
    pub fn set_dialog(&self, dialog: Arc<Dialog>) -> Option<Arc<Dialog>> {
        self.dialog.lock().replace(dialog)
    }

    pub fn take_dialog(&self) -> Option<Arc<Dialog>> {
        self.dialog.lock().take()
    }

    /// Arm a new refresh timer, canceling the previous one
    pub fn set_refresh_timer(&self, timer: TimerHandle) {
        if let Some(previous) = self.refresh_timer.lock().replace(timer) {
            previous.cancel();
        }
    }

    pub fn cancel_refresh_timer(&self) {
        if let Some(timer) = self.refresh_timer.lock().take() {
            timer.cancel();
        }
    }

    pub fn has_refresh_timer(&self) -> bool {
        self.refresh_timer
            .lock()
            .as_ref()
            .map(|t| !t.is_canceled())
            .unwrap_or(false)
    }

    pub fn set_pending(&self, transaction: TransactionId) {
        *self.pending.lock() = Some(transaction);
    }

    pub fn take_pending(&self) -> Option<TransactionId> {
        self.pending.lock().take()
    }

    /// Clear the pending transaction if it is `transaction`
    pub fn complete_pending(&self, transaction: &TransactionId) {
        let mut pending = self.pending.lock();
        if pending.as_ref() == Some(transaction) {
            *pending = None;
        }
    }
}

impl fmt::Debug for TrackedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedSubscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("call_id", &self.call_id())
            .field("dialog", &self.dialog().map(|d| d.id().clone()))
            .finish()
    }
}

#[derive(Default)]
struct Indices {
    by_call_id: HashMap<CallId, Arc<TrackedSubscription>>,
    by_key: HashMap<SubscriptionKey, CallId>,
}

impl Indices {
    fn unlink(&mut self, call_id: &CallId) -> Option<Arc<TrackedSubscription>> {
        let removed = self.by_call_id.remove(call_id)?;
        if self.by_key.get(removed.key()) == Some(call_id) {
            self.by_key.remove(removed.key());
        }
        Some(removed)
    }
}

/// Both indices behind one lock
#[derive(Default)]
pub struct SubscriptionRegistry {
    indices: RwLock<Indices>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn find_by_key(&self, key: &SubscriptionKey) -> Option<Arc<TrackedSubscription>> {
        let indices = self.indices.read().await;
        let call_id = indices.by_key.get(key)?;
        indices.by_call_id.get(call_id).cloned()
    }

    pub async fn find_by_call_id(&self, call_id: &CallId) -> Option<Arc<TrackedSubscription>> {
        self.indices.read().await.by_call_id.get(call_id).cloned()
    }

    /// Register `subscription` under `call_id`
    ///
    /// Returns false, changing nothing, when a different subscription holds
    /// the same key. A different occupant of `call_id` is replaced; the same
    /// subscription moves from its previous Call-ID.
    pub async fn add(&self, call_id: CallId, subscription: Arc<TrackedSubscription>) -> bool {
        let mut indices = self.indices.write().await;

        if let Some(existing_call_id) = indices.by_key.get(subscription.key()).cloned() {
            let existing_id = indices.by_call_id.get(&existing_call_id).map(|s| s.id());
            match existing_id {
                Some(id) if id != subscription.id() => return false,
                Some(_) if existing_call_id != call_id => {
                    indices.by_call_id.remove(&existing_call_id);
                }
                _ => {}
            }
        }

        if let Some(occupant) = indices.unlink(&call_id) {
            if occupant.id() != subscription.id() {
                debug!("Call-ID {} reassigned from {}", call_id, occupant.key());
            }
        }

        subscription.set_call_id(call_id.clone());
        indices
            .by_key
            .insert(subscription.key().clone(), call_id.clone());
        indices.by_call_id.insert(call_id, subscription);
        true
    }

    /// Remove `subscription` if it is the one registered under `call_id`
    pub async fn remove(&self, call_id: &CallId, subscription: &TrackedSubscription) -> bool {
        let mut indices = self.indices.write().await;
        let current = indices.by_call_id.get(call_id).map(|s| s.id());
        if current != Some(subscription.id()) {
            return false;
        }
        indices.unlink(call_id);
        true
    }

    pub async fn snapshot(&self) -> Vec<Arc<TrackedSubscription>> {
        self.indices.read().await.by_call_id.values().cloned().collect()
    }

    /// Drop everything, returning what was registered
    pub async fn clear(&self) -> Vec<Arc<TrackedSubscription>> {
        let mut indices = self.indices.write().await;
        indices.by_key.clear();
        indices.by_call_id.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.indices.read().await.by_call_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
