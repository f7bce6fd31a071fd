//! SUBSCRIBE/NOTIFY client for one event package (RFC 3265)
//!
//! The engine sends SUBSCRIBEs, keeps accepted subscriptions refreshed ahead
//! of their expiry, answers NOTIFYs and binds every subscription to the
//! dialog its 2xx created. All sends are fire-and-forget; outcomes come back
//! through `process_response`, `process_request` and `process_timeout`.

use super::ledger::{DialogSubscriptionLedger, LedgerError};
use super::registry::{SubscriptionKey, SubscriptionRegistry, TrackedSubscription};
use crate::domain::registration::ConnectivitySignal;
use crate::domain::shared::{CallId, DialogId, SipAddress, SubscriptionId};
use crate::domain::subscription::{EventPackage, Subscription};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::auth::ChallengeHandler;
use crate::infrastructure::protocols::sip::builder::MessageFactory;
use crate::infrastructure::protocols::sip::dialog::Dialog;
use crate::infrastructure::protocols::sip::handler::{RequestEvent, ResponseEvent, TimeoutEvent};
use crate::infrastructure::protocols::sip::headers::{
    media_sub_type, EventHeader, HeaderBag, SubscriptionStateHeader,
};
use crate::infrastructure::protocols::sip::message::{SipError, SipMethod, SipRequest};
use crate::infrastructure::protocols::sip::transaction::{TransactionId, TransactionEngine};
use crate::infrastructure::scheduler::TimerScheduler;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    #[error("Already subscribed to {0} with another handler")]
    AlreadySubscribed(String),

    #[error("Dialog {0} is no longer usable")]
    DialogUnusable(DialogId),

    #[error(transparent)]
    Sip(#[from] SipError),
}

impl From<LedgerError> for SubscriptionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::DialogUnusable(id) => SubscriptionError::DialogUnusable(id),
        }
    }
}

/// Subscription lifetimes, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Expires requested in every SUBSCRIBE
    pub duration: u32,
    /// How long before expiry a refresh is sent
    pub refresh_margin: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            duration: 3600,
            refresh_margin: 60,
        }
    }
}

/// Delay before refreshing a subscription granted for `expires` seconds
///
/// The margin only applies when the grant is at least twice the margin;
/// shorter grants are refreshed when they expire.
pub fn refresh_delay(expires: u32, margin: u32) -> Duration {
    let seconds = if expires >= margin.saturating_mul(2) {
        expires - margin
    } else {
        expires
    };
    Duration::from_secs(u64::from(seconds))
}

/// Collaborators shared by every engine of one account
#[derive(Clone)]
pub struct EngineContext {
    pub scheduler: Arc<TimerScheduler>,
    pub ledger: Arc<DialogSubscriptionLedger>,
    pub transactions: Arc<dyn TransactionEngine>,
    pub messages: Arc<dyn MessageFactory>,
    pub challenges: Arc<dyn ChallengeHandler>,
    pub connectivity: Arc<dyn ConnectivitySignal>,
}

struct EngineInner {
    package: EventPackage,
    config: SubscriptionConfig,
    registry: SubscriptionRegistry,
    context: EngineContext,
}

/// Subscription engine for one event package
#[derive(Clone)]
pub struct SubscriptionEngine {
    inner: Arc<EngineInner>,
}

impl SubscriptionEngine {
    pub fn new(package: EventPackage, config: SubscriptionConfig, context: EngineContext) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                package,
                config,
                registry: SubscriptionRegistry::new(),
                context,
            }),
        }
    }

    pub fn package(&self) -> EventPackage {
        self.inner.package
    }

    pub fn config(&self) -> SubscriptionConfig {
        self.inner.config
    }

    /// Subscribe, or refresh if this very handler is already subscribed
    pub async fn subscribe(
        &self,
        subscription: Arc<dyn Subscription>,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let package = self.inner.package;
        if subscription.package() != package {
            return Err(SipError::Internal(format!(
                "{} subscription handed to the {} engine",
                subscription.package(),
                package
            ))
            .into());
        }

        let key = SubscriptionKey::of(subscription.as_ref());
        if let Some(existing) = self.inner.registry.find_by_key(&key).await {
            if !Arc::ptr_eq(existing.handler(), &subscription) {
                return Err(SubscriptionError::AlreadySubscribed(key.to_string()));
            }
            debug!("Re-subscribing {} to {}", key, package);
            self.send_subscribe(&existing, self.inner.config.duration).await?;
            return Ok(existing.id());
        }

        let request = self.build_subscribe(subscription.as_ref(), None, self.inner.config.duration)?;
        let call_id = call_id_of(&request)?;
        let tracked = Arc::new(TrackedSubscription::new(subscription, call_id.clone()));
        if !self.inner.registry.add(call_id, tracked.clone()).await {
            return Err(SubscriptionError::AlreadySubscribed(key.to_string()));
        }

        if let Err(e) = self.transmit(&tracked, request, None).await {
            warn!("SUBSCRIBE to {} for {} failed: {}", key, package, e);
            self.deregister(&tracked).await;
            return Err(e);
        }

        info!("Subscribed to {} for {}", package, key);
        Ok(tracked.id())
    }

    /// Subscribe unless `(address, event id)` is already subscribed
    pub async fn poll(
        &self,
        subscription: Arc<dyn Subscription>,
    ) -> Result<Option<SubscriptionId>, SubscriptionError> {
        let key = SubscriptionKey::of(subscription.as_ref());
        if self.inner.registry.find_by_key(&key).await.is_some() {
            return Ok(None);
        }
        self.subscribe(subscription).await.map(Some)
    }

    /// Send an Expires=0 SUBSCRIBE and forget the subscription
    pub async fn unsubscribe(
        &self,
        address: &SipAddress,
        event_id: Option<&str>,
        assert_subscribed: bool,
    ) -> Result<(), SubscriptionError> {
        let key = SubscriptionKey::new(address.clone(), event_id.map(str::to_string));
        let Some(tracked) = self.inner.registry.find_by_key(&key).await else {
            if assert_subscribed {
                return Err(SubscriptionError::NotSubscribed(key.to_string()));
            }
            debug!("Unsubscribe of {} ignored, not subscribed", key);
            return Ok(());
        };

        let dialog = tracked.live_dialog();
        let request = self.build_subscribe(tracked.handler().as_ref(), dialog.as_deref(), 0)?;

        self.deregister(&tracked).await;
        if let Some(pending) = tracked.take_pending() {
            self.inner.context.transactions.cancel(&pending).await;
        }

        self.inner
            .context
            .transactions
            .send_request(request, dialog)
            .await?;
        metrics::record_subscribe_sent(self.inner.package.name, true);
        info!("Unsubscribed from {} for {}", self.inner.package, key);
        Ok(())
    }

    /// Forget a subscription without signaling anything
    pub async fn remove_subscription(&self, address: &SipAddress, event_id: Option<&str>) -> bool {
        let key = SubscriptionKey::new(address.clone(), event_id.map(str::to_string));
        match self.inner.registry.find_by_key(&key).await {
            Some(tracked) => self.deregister(&tracked).await,
            None => false,
        }
    }

    pub async fn subscriptions(&self) -> Vec<Arc<TrackedSubscription>> {
        self.inner.registry.snapshot().await
    }

    pub async fn is_subscribed(&self, address: &SipAddress, event_id: Option<&str>) -> bool {
        let key = SubscriptionKey::new(address.clone(), event_id.map(str::to_string));
        self.inner.registry.find_by_key(&key).await.is_some()
    }

    /// Stop every refresh and abandon in-flight SUBSCRIBEs
    pub async fn cancel_refresh_timers(&self) {
        for tracked in self.inner.registry.snapshot().await {
            tracked.cancel_refresh_timer();
            if let Some(pending) = tracked.take_pending() {
                self.inner.context.transactions.cancel(&pending).await;
            }
        }
    }

    /// Drop every subscription, releasing the dialogs they held
    pub async fn release(&self) {
        let released = self.inner.registry.clear().await;
        for tracked in &released {
            tracked.cancel_refresh_timer();
            if let Some(dialog) = tracked.take_dialog() {
                self.release_dialog(&dialog, tracked.id());
            }
        }
        if !released.is_empty() {
            debug!("Released {} {} subscriptions", released.len(), self.inner.package);
        }
    }

    /// Handle a final response. Returns false if it is not ours to handle.
    pub async fn process_response(&self, event: &ResponseEvent) -> bool {
        let response = &event.response;
        let request = &event.transaction.request;

        let is_subscribe = response
            .cseq()
            .map(|c| c.method == SipMethod::Subscribe.as_str())
            .unwrap_or(false);
        if !is_subscribe || !self.owns_event(request.header("Event").as_deref()) {
            return false;
        }

        let Some(call_id) = response.call_id().map(CallId::new) else {
            return false;
        };
        let status = response.status_code();
        let tracked = self.inner.registry.find_by_call_id(&call_id).await;

        let tracked = match tracked {
            Some(tracked) if response.expires() != Some(0) => tracked,
            _ => return self.process_unsubscribe_response(event).await,
        };
        tracked.complete_pending(&event.transaction.id);

        match status {
            200 | 202 => self.on_accepted(&tracked, event).await,
            201..=299 => {
                debug!("Ignoring {} to SUBSCRIBE for {}", status, tracked.key());
                true
            }
            300..=399 => {
                info!("SUBSCRIBE for {} redirected with {}, not following", tracked.key(), status);
                true
            }
            423 => self.retry_with_min_expires(&tracked, event).await,
            401 | 407 => {
                match self
                    .inner
                    .context
                    .challenges
                    .handle_challenge(&event.transaction, response, tracked.live_dialog())
                    .await
                {
                    Ok(id) => tracked.set_pending(id),
                    Err(e) => {
                        warn!("Authentication of SUBSCRIBE for {} failed: {}", tracked.key(), e);
                        self.fail(&tracked, status).await;
                    }
                }
                true
            }
            400..=699 => {
                warn!("SUBSCRIBE for {} rejected with {}", tracked.key(), status);
                self.fail(&tracked, status).await;
                true
            }
            _ => false,
        }
    }

    /// Handle an incoming NOTIFY. Returns false if it is not ours to handle.
    pub async fn process_request(&self, event: &RequestEvent) -> bool {
        let request = &event.request;
        if request.method() != Some(SipMethod::Notify)
            || !self.owns_event(request.header("Event").as_deref())
        {
            return false;
        }

        let Some(state) = request
            .header("Subscription-State")
            .and_then(|v| SubscriptionStateHeader::parse(&v))
        else {
            warn!("NOTIFY for {} without Subscription-State", self.inner.package);
            return false;
        };

        let tracked = match request.call_id() {
            Some(call_id) => self.inner.registry.find_by_call_id(&CallId::new(call_id)).await,
            None => None,
        };

        if tracked.is_none() && !state.is_terminated() {
            debug!(
                "NOTIFY for unknown {} subscription {}",
                self.inner.package,
                request.call_id().unwrap_or_default()
            );
            self.respond(event, 481, HeaderBag::new()).await;
            return true;
        }

        if let Some(content_type) = request.header("Content-Type") {
            let expected = self.inner.package.content_sub_type;
            if media_sub_type(&content_type).as_deref() != Some(expected) {
                warn!(
                    "NOTIFY for {} carries {}, expected {}",
                    self.inner.package, content_type, expected
                );
                let accept = HeaderBag::new().with("Accept", self.inner.package.accept());
                self.respond(event, 415, accept).await;
            }
        }

        // A terminated NOTIFY for a subscription already gone is still acknowledged
        let Some(tracked) = tracked else {
            self.respond(event, 200, HeaderBag::new()).await;
            return true;
        };

        if state.is_terminated() {
            if self.deregister(&tracked).await {
                info!(
                    "Subscription to {} for {} terminated ({})",
                    self.inner.package,
                    tracked.key(),
                    state.reason.as_deref().unwrap_or("no reason")
                );
                metrics::record_subscription_terminated(self.inner.package.name);
                tracked.handler().on_terminated(state.reason.as_deref());
            }
            self.respond(event, 200, HeaderBag::new()).await;
        } else {
            self.respond(event, 200, HeaderBag::new()).await;
            tracked.handler().on_active_notify(request.body());
        }
        true
    }

    /// A SUBSCRIBE of this package never got a final response
    pub async fn process_timeout(&self, event: &TimeoutEvent) -> bool {
        let request = &event.transaction.request;
        if request.method() != Some(SipMethod::Subscribe)
            || !self.owns_event(request.header("Event").as_deref())
        {
            return false;
        }

        warn!("SUBSCRIBE for {} timed out", self.inner.package);
        if let Some(call_id) = request.call_id().map(CallId::new) {
            if let Some(tracked) = self.inner.registry.find_by_call_id(&call_id).await {
                tracked.complete_pending(&event.transaction.id);
            }
        }
        metrics::record_connection_failure("subscribe_timeout");
        self.inner.context.connectivity.notify_connection_failed();
        true
    }

    fn owns_event(&self, event: Option<&str>) -> bool {
        event
            .and_then(EventHeader::parse)
            .map(|e| e.package == self.inner.package.name)
            .unwrap_or(false)
    }

    fn build_subscribe(
        &self,
        subscription: &dyn Subscription,
        dialog: Option<&Dialog>,
        expires: u32,
    ) -> Result<SipRequest, SipError> {
        let headers = HeaderBag::new()
            .with("Event", EventHeader::render(self.inner.package.name, subscription.event_id()))
            .with("Accept", self.inner.package.accept())
            .with("Expires", expires.to_string());
        self.inner
            .context
            .messages
            .create_request(SipMethod::Subscribe, subscription.address(), dialog, headers)
    }

    /// Send a SUBSCRIBE for an already registered subscription
    async fn send_subscribe(
        &self,
        tracked: &Arc<TrackedSubscription>,
        expires: u32,
    ) -> Result<TransactionId, SubscriptionError> {
        let dialog = tracked.live_dialog();
        let request = self.build_subscribe(tracked.handler().as_ref(), dialog.as_deref(), expires)?;

        if dialog.is_none() {
            let call_id = call_id_of(&request)?;
            if call_id != tracked.call_id() {
                self.inner.registry.add(call_id, tracked.clone()).await;
            }
        }

        self.transmit(tracked, request, dialog).await
    }

    async fn transmit(
        &self,
        tracked: &TrackedSubscription,
        request: SipRequest,
        dialog: Option<Arc<Dialog>>,
    ) -> Result<TransactionId, SubscriptionError> {
        if let Some(previous) = tracked.take_pending() {
            self.inner.context.transactions.cancel(&previous).await;
        }
        let id = self
            .inner
            .context
            .transactions
            .send_request(request, dialog)
            .await?;
        tracked.set_pending(id.clone());
        metrics::record_subscribe_sent(self.inner.package.name, false);
        Ok(id)
    }

    async fn on_accepted(&self, tracked: &Arc<TrackedSubscription>, event: &ResponseEvent) -> bool {
        let status = event.response.status_code();
        let Some(expires) = event.response.expires() else {
            error!("{} to SUBSCRIBE for {} without Expires", status, tracked.key());
            return false;
        };

        self.arm_refresh(tracked, expires);

        if let Some(dialog) = &event.dialog {
            if let Err(e) = self.bind_dialog(tracked, dialog) {
                warn!("Cannot bind {} to its dialog: {}", tracked.key(), e);
                if self.deregister(tracked).await {
                    metrics::record_subscription_failed(self.inner.package.name, 481);
                    tracked.handler().on_failure(481);
                }
                return true;
            }
        }

        debug!("{} subscription for {} accepted for {}s", self.inner.package, tracked.key(), expires);
        tracked.handler().on_success(status);
        true
    }

    fn arm_refresh(&self, tracked: &Arc<TrackedSubscription>, expires: u32) {
        let delay = refresh_delay(expires, self.inner.config.refresh_margin);
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(tracked);

        let timer = self.inner.context.scheduler.schedule_once(delay, async move {
            let (Some(inner), Some(tracked)) = (engine.upgrade(), target.upgrade()) else {
                return;
            };
            SubscriptionEngine { inner }.refresh(tracked).await;
        });
        tracked.set_refresh_timer(timer);
    }

    async fn refresh(&self, tracked: Arc<TrackedSubscription>) {
        let registered = self
            .inner
            .registry
            .find_by_call_id(&tracked.call_id())
            .await
            .map(|current| current.id() == tracked.id())
            .unwrap_or(false);
        if !registered {
            return;
        }

        debug!("Refreshing {} subscription for {}", self.inner.package, tracked.key());
        metrics::record_subscription_refresh(self.inner.package.name);
        if let Err(e) = self.send_subscribe(&tracked, self.inner.config.duration).await {
            warn!("Refresh of {} failed: {}", tracked.key(), e);
            if matches!(&e, SubscriptionError::Sip(sip) if sip.is_network()) {
                metrics::record_connection_failure("subscribe_refresh");
                self.inner.context.connectivity.notify_connection_failed();
            }
        }
    }

    async fn retry_with_min_expires(&self, tracked: &TrackedSubscription, event: &ResponseEvent) -> bool {
        let Some(min_expires) = event
            .response
            .header("Min-Expires")
            .and_then(|v| v.trim().parse::<u32>().ok())
        else {
            error!("423 to SUBSCRIBE for {} without a usable Min-Expires", tracked.key());
            self.fail(tracked, 423).await;
            return true;
        };

        let mut request = event.transaction.request.clone();
        request.set_header("Expires", min_expires.to_string());

        let dialog = request.to_tag().and_then(|_| tracked.live_dialog());
        let seq = match &dialog {
            Some(dialog) => dialog.next_cseq(),
            None => request.cseq().map(|c| c.seq + 1).unwrap_or(1),
        };
        request.set_cseq(seq);
        request.set_branch(&TransactionId::generate().0);

        info!("Retrying SUBSCRIBE for {} with Expires {}", tracked.key(), min_expires);
        if let Err(e) = self.transmit(tracked, request, dialog).await {
            warn!("Retry of SUBSCRIBE for {} failed: {}", tracked.key(), e);
        }
        true
    }

    async fn process_unsubscribe_response(&self, event: &ResponseEvent) -> bool {
        let status = event.response.status_code();
        match status {
            401 | 407 => {
                if let Err(e) = self
                    .inner
                    .context
                    .challenges
                    .handle_challenge(&event.transaction, &event.response, event.dialog.clone())
                    .await
                {
                    warn!("Authentication of unsubscribe failed: {}", e);
                }
                true
            }
            200 | 202 => {
                if let Some(dialog) = &event.dialog {
                    if !self.inner.context.ledger.has_subscriptions(dialog.id()) {
                        dialog.terminate();
                    }
                }
                false
            }
            _ => true,
        }
    }

    /// Attach to `dialog`, releasing any other dialog held before
    fn bind_dialog(&self, tracked: &TrackedSubscription, dialog: &Arc<Dialog>) -> Result<(), LedgerError> {
        self.inner.context.ledger.attach(dialog, tracked.id())?;
        if let Some(previous) = tracked.set_dialog(dialog.clone()) {
            if previous.id() != dialog.id() {
                self.release_dialog(&previous, tracked.id());
            }
        }
        Ok(())
    }

    fn release_dialog(&self, dialog: &Dialog, subscription: SubscriptionId) {
        let ledger = &self.inner.context.ledger;
        if ledger.detach(dialog, subscription) && !ledger.has_subscriptions(dialog.id()) {
            dialog.terminate();
        }
    }

    /// Remove from the registry, cancel the refresh and release the dialog.
    /// Returns false if someone else already did.
    async fn deregister(&self, tracked: &TrackedSubscription) -> bool {
        if !self.inner.registry.remove(&tracked.call_id(), tracked).await {
            return false;
        }
        tracked.cancel_refresh_timer();
        if let Some(dialog) = tracked.take_dialog() {
            self.release_dialog(&dialog, tracked.id());
        }
        true
    }

    async fn fail(&self, tracked: &TrackedSubscription, status_code: u16) {
        if self.deregister(tracked).await {
            metrics::record_subscription_failed(self.inner.package.name, status_code);
            tracked.handler().on_failure(status_code);
        }
    }

    async fn respond(&self, event: &RequestEvent, status_code: u16, headers: HeaderBag) {
        let context = &self.inner.context;
        let response = match context.messages.create_response(&event.request, status_code, headers) {
            Ok(response) => response,
            Err(e) => {
                warn!("Cannot build {} for NOTIFY: {}", status_code, e);
                return;
            }
        };
        if let Err(e) = context.transactions.send_response(event, response).await {
            warn!("Failed to send {} for NOTIFY: {}", status_code, e);
        }
    }
}

fn call_id_of(request: &SipRequest) -> Result<CallId, SipError> {
    request
        .call_id()
        .map(CallId::new)
        .ok_or_else(|| SipError::InvalidMessage("SUBSCRIBE without Call-ID".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_delay_applies_margin() {
        assert_eq!(refresh_delay(3600, 600), Duration::from_secs(3000));
        assert_eq!(refresh_delay(1200, 600), Duration::from_secs(600));
    }

    #[test]
    fn test_refresh_delay_without_room_for_margin() {
        assert_eq!(refresh_delay(1000, 600), Duration::from_secs(1000));
        assert_eq!(refresh_delay(0, 60), Duration::from_secs(0));
    }

    #[test]
    fn test_ledger_error_maps_to_dialog_unusable() {
        let id = DialogId::new(CallId::new("c1"), "a", "b");
        assert_eq!(
            SubscriptionError::from(LedgerError::DialogUnusable(id.clone())),
            SubscriptionError::DialogUnusable(id)
        );
    }
}
