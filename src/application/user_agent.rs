//! User agent service
//!
//! Wires one account together: the shared timer scheduler, the dialog
//! ledger, one subscription engine per enabled event package and the
//! registration watchdog. It is the `SipListener` of the stack and routes
//! every callback to the component that owns it.

use crate::domain::registration::{ConnectivitySignal, RegistrationStatus};
use crate::domain::shared::{SipAddress, SubscriptionId};
use crate::domain::subscription::{EventPackage, Subscription};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::auth::ChallengeHandler;
use crate::infrastructure::protocols::sip::builder::MessageFactory;
use crate::infrastructure::protocols::sip::handler::{
    IoErrorEvent, RequestEvent, ResponseEvent, SipListener, TimeoutEvent,
};
use crate::infrastructure::protocols::sip::headers::HeaderBag;
use crate::infrastructure::protocols::sip::message::{SipError, SipMethod};
use crate::infrastructure::protocols::sip::subscription::{
    DialogSubscriptionLedger, EngineContext, SubscriptionConfig, SubscriptionEngine,
    SubscriptionError,
};
use crate::infrastructure::protocols::sip::transaction::TransactionEngine;
use crate::infrastructure::protocols::sip::watchdog::{RegistrationWatchdog, WatchdogConfig};
use crate::infrastructure::scheduler::TimerScheduler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ALLOWED_METHODS: &str = "SUBSCRIBE, NOTIFY, BYE, OPTIONS";

/// Everything the user agent needs to know about its account
#[derive(Debug, Clone)]
pub struct UserAgentConfig {
    /// Address of record
    pub address: SipAddress,
    pub subscription: SubscriptionConfig,
    pub packages: Vec<EventPackage>,
    pub watchdog: WatchdogConfig,
}

/// Signaling core of one account
pub struct UserAgent {
    scheduler: Arc<TimerScheduler>,
    ledger: Arc<DialogSubscriptionLedger>,
    engines: Vec<SubscriptionEngine>,
    watchdog: RegistrationWatchdog,
    status: Arc<RegistrationStatus>,
    transactions: Arc<dyn TransactionEngine>,
    messages: Arc<dyn MessageFactory>,
    state_task: Mutex<Option<JoinHandle<()>>>,
}

impl UserAgent {
    pub fn new(
        config: UserAgentConfig,
        transactions: Arc<dyn TransactionEngine>,
        messages: Arc<dyn MessageFactory>,
        challenges: Arc<dyn ChallengeHandler>,
        status: Arc<RegistrationStatus>,
    ) -> Self {
        let scheduler = Arc::new(TimerScheduler::new());
        let ledger = Arc::new(DialogSubscriptionLedger::new());
        let connectivity: Arc<dyn ConnectivitySignal> = status.clone();

        let context = EngineContext {
            scheduler: scheduler.clone(),
            ledger: ledger.clone(),
            transactions: transactions.clone(),
            messages: messages.clone(),
            challenges,
            connectivity: connectivity.clone(),
        };

        let mut engines: Vec<SubscriptionEngine> = Vec::new();
        for package in config.packages {
            if engines.iter().any(|e| e.package() == package) {
                continue;
            }
            engines.push(SubscriptionEngine::new(package, config.subscription, context.clone()));
        }

        let watchdog = RegistrationWatchdog::new(
            config.watchdog,
            config.address,
            scheduler.clone(),
            transactions.clone(),
            messages.clone(),
            connectivity,
        );

        Self {
            scheduler,
            ledger,
            engines,
            watchdog,
            status,
            transactions,
            messages,
            state_task: Mutex::new(None),
        }
    }

    /// Follow registration state changes with the watchdog
    pub fn start(&self) {
        let mut task = self.state_task.lock();
        if task.is_some() {
            return;
        }

        let mut changes = self.status.subscribe();
        let watchdog = self.watchdog.clone();
        *task = Some(tokio::spawn(async move {
            let initial = changes.borrow_and_update().new_state;
            watchdog.on_registration_state_changed(initial);
            while changes.changed().await.is_ok() {
                let state = changes.borrow_and_update().new_state;
                watchdog.on_registration_state_changed(state);
            }
        }));
        info!("User agent started with {} event packages", self.engines.len());
    }

    pub fn engine(&self, package: EventPackage) -> Option<&SubscriptionEngine> {
        self.engines.iter().find(|e| e.package() == package)
    }

    pub fn engines(&self) -> &[SubscriptionEngine] {
        &self.engines
    }

    pub fn ledger(&self) -> &Arc<DialogSubscriptionLedger> {
        &self.ledger
    }

    pub fn watchdog(&self) -> &RegistrationWatchdog {
        &self.watchdog
    }

    pub fn status(&self) -> &Arc<RegistrationStatus> {
        &self.status
    }

    pub async fn subscribe(
        &self,
        subscription: Arc<dyn Subscription>,
    ) -> Result<SubscriptionId, SubscriptionError> {
        self.engine_for(subscription.package())?
            .subscribe(subscription)
            .await
    }

    pub async fn unsubscribe(
        &self,
        package: EventPackage,
        address: &SipAddress,
        event_id: Option<&str>,
    ) -> Result<(), SubscriptionError> {
        self.engine_for(package)?
            .unsubscribe(address, event_id, true)
            .await
    }

    fn engine_for(&self, package: EventPackage) -> Result<&SubscriptionEngine, SubscriptionError> {
        self.engine(package).ok_or_else(|| {
            SubscriptionError::Sip(SipError::Internal(format!(
                "Event package {} is not enabled",
                package
            )))
        })
    }

    /// Stop refreshes, then the watchdog, then drop every subscription
    pub async fn shutdown(&self) {
        info!("Shutting down user agent");
        for engine in &self.engines {
            engine.cancel_refresh_timers().await;
        }
        self.watchdog.stop();
        self.scheduler.cancel_all();
        for engine in &self.engines {
            engine.release().await;
        }
        if let Some(task) = self.state_task.lock().take() {
            task.abort();
        }
    }

    async fn respond(&self, event: &RequestEvent, status_code: u16, headers: HeaderBag) {
        match self.messages.create_response(&event.request, status_code, headers) {
            Ok(response) => {
                if let Err(e) = self.transactions.send_response(event, response).await {
                    warn!("Failed to send {}: {}", status_code, e);
                }
            }
            Err(e) => warn!("Cannot build {} response: {}", status_code, e),
        }
    }

    async fn handle_bye(&self, event: &RequestEvent) {
        let Some(dialog) = &event.dialog else {
            debug!("BYE outside of any dialog");
            self.respond(event, 481, HeaderBag::new()).await;
            return;
        };

        let alive = self.ledger.on_bye_received(dialog);
        self.respond(event, 200, HeaderBag::new()).await;
        if alive {
            info!("Dialog {} kept alive by its subscriptions after BYE", dialog.id());
        } else {
            dialog.terminate();
            debug!("Dialog {} terminated by BYE", dialog.id());
        }
    }
}

#[async_trait]
impl SipListener for UserAgent {
    async fn on_request(&self, event: RequestEvent) {
        match event.request.method() {
            Some(SipMethod::Notify) => {
                for engine in &self.engines {
                    if engine.process_request(&event).await {
                        return;
                    }
                }
                debug!("NOTIFY for an event package we do not handle");
                self.respond(&event, 489, HeaderBag::new()).await;
            }
            Some(SipMethod::Bye) => self.handle_bye(&event).await,
            Some(SipMethod::Options) => {
                let allow = HeaderBag::new().with("Allow", ALLOWED_METHODS);
                self.respond(&event, 200, allow).await;
            }
            Some(SipMethod::Ack) => {}
            _ => {
                debug!("{} not implemented", event.request.method_name());
                self.respond(&event, 501, HeaderBag::new()).await;
            }
        }
    }

    async fn on_response(&self, event: ResponseEvent) {
        let method = event.response.cseq().map(|c| c.method).unwrap_or_default();
        let handled = if method == SipMethod::Subscribe.as_str() {
            let mut handled = false;
            for engine in &self.engines {
                if engine.process_response(&event).await {
                    handled = true;
                    break;
                }
            }
            handled
        } else if method == SipMethod::Options.as_str() {
            self.watchdog.process_response(&event)
        } else {
            false
        };

        if !handled {
            debug!(
                "Response {} to {} left unhandled",
                event.response.status_code(),
                method
            );
        }
    }

    async fn on_timeout(&self, event: TimeoutEvent) {
        for engine in &self.engines {
            if engine.process_timeout(&event).await {
                return;
            }
        }
        if !self.watchdog.process_timeout(&event) {
            debug!("Transaction {} timed out", event.transaction.id);
        }
    }

    async fn on_io_error(&self, event: IoErrorEvent) {
        warn!("Transport failure: {}", event.reason);
        metrics::record_connection_failure("io_error");
        self.status.notify_connection_failed();
    }

    fn on_traffic(&self) {
        self.watchdog.packet_received();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registration::RegistrationState;
    use crate::infrastructure::protocols::sip::auth::MockChallengeHandler;
    use crate::infrastructure::protocols::sip::builder::AccountMessageFactory;
    use crate::infrastructure::protocols::sip::dialog::tests::test_dialog;
    use crate::infrastructure::protocols::sip::dialog::Dialog;
    use crate::infrastructure::protocols::sip::message::{SipRequest, SipResponse};
    use crate::infrastructure::protocols::sip::transaction::TransactionId;
    use crate::infrastructure::protocols::sip::watchdog::KeepAliveMethod;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingEngine {
        responses: Mutex<Vec<SipResponse>>,
    }

    #[async_trait]
    impl TransactionEngine for RecordingEngine {
        async fn send_request(
            &self,
            request: SipRequest,
            _dialog: Option<Arc<Dialog>>,
        ) -> Result<TransactionId, SipError> {
            Ok(TransactionId::from_branch(&request.branch().unwrap_or_default()))
        }

        async fn send_response(&self, _event: &RequestEvent, response: SipResponse) -> Result<(), SipError> {
            self.responses.lock().push(response);
            Ok(())
        }

        async fn cancel(&self, _id: &TransactionId) {}

        async fn send_keep_alive(&self) -> Result<(), SipError> {
            Ok(())
        }
    }

    fn user_agent(engine: Arc<RecordingEngine>) -> UserAgent {
        let address = SipAddress::parse("sip:alice@example.com").unwrap();
        UserAgent::new(
            UserAgentConfig {
                address: address.clone(),
                subscription: SubscriptionConfig::default(),
                packages: vec![EventPackage::PRESENCE, EventPackage::PRESENCE],
                watchdog: WatchdogConfig {
                    method: KeepAliveMethod::Options,
                    interval: Duration::from_secs(30),
                    has_registrar: true,
                },
            },
            engine,
            Arc::new(AccountMessageFactory::new(address, "192.168.1.100:5060", "yakua-test")),
            Arc::new(MockChallengeHandler::new()),
            Arc::new(RegistrationStatus::new()),
        )
    }

    fn request(method: &str, call_id: &str, extra: &str) -> SipRequest {
        let data = format!(
            "{} sip:alice@192.168.1.100:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKin1\r\n\
             From: <sip:bob@example.com>;tag=srv1\r\n\
             To: <sip:alice@example.com>;tag=ua1\r\n\
             Call-ID: {}\r\n\
             CSeq: 5 {}\r\n\
             {}\
             Content-Length: 0\r\n\r\n",
            method, call_id, method, extra
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    fn event(request: SipRequest, dialog: Option<Arc<Dialog>>) -> RequestEvent {
        RequestEvent {
            request,
            source: "10.0.0.2:5060".parse().unwrap(),
            dialog,
        }
    }

    fn statuses(engine: &RecordingEngine) -> Vec<u16> {
        engine.responses.lock().iter().map(|r| r.status_code()).collect()
    }

    #[tokio::test]
    async fn test_duplicate_packages_share_one_engine() {
        let ua = user_agent(Arc::new(RecordingEngine::default()));
        assert_eq!(ua.engines().len(), 1);
        assert!(ua.engine(EventPackage::DIALOG).is_none());
    }

    #[tokio::test]
    async fn test_bye_deferred_while_subscriptions_attached() {
        let engine = Arc::new(RecordingEngine::default());
        let ua = user_agent(engine.clone());
        let dialog = test_dialog("bye1@host");
        ua.ledger().attach(&dialog, SubscriptionId::new()).unwrap();

        ua.on_request(event(request("BYE", "bye1@host", ""), Some(dialog.clone())))
            .await;

        assert_eq!(statuses(&engine), vec![200]);
        assert!(!dialog.is_terminated());
        assert!(ua.ledger().is_bye_processed(dialog.id()));
    }

    #[tokio::test]
    async fn test_bye_without_subscriptions_terminates_dialog() {
        let engine = Arc::new(RecordingEngine::default());
        let ua = user_agent(engine.clone());
        let dialog = test_dialog("bye2@host");

        ua.on_request(event(request("BYE", "bye2@host", ""), Some(dialog.clone())))
            .await;

        assert_eq!(statuses(&engine), vec![200]);
        assert!(dialog.is_terminated());
    }

    #[tokio::test]
    async fn test_unknown_method_gets_501() {
        let engine = Arc::new(RecordingEngine::default());
        let ua = user_agent(engine.clone());

        ua.on_request(event(request("INFO", "info@host", ""), None)).await;
        assert_eq!(statuses(&engine), vec![501]);
    }

    #[tokio::test]
    async fn test_notify_for_disabled_package_gets_489() {
        let engine = Arc::new(RecordingEngine::default());
        let ua = user_agent(engine.clone());

        let notify = request(
            "NOTIFY",
            "mwi@host",
            "Event: message-summary\r\nSubscription-State: active\r\n",
        );
        ua.on_request(event(notify, None)).await;
        assert_eq!(statuses(&engine), vec![489]);
    }

    #[tokio::test]
    async fn test_io_error_reports_connection_failure() {
        let ua = user_agent(Arc::new(RecordingEngine::default()));
        ua.status().set_state(RegistrationState::Registered, None);

        ua.on_io_error(IoErrorEvent {
            transaction: None,
            reason: "connection reset".to_string(),
        })
        .await;

        assert_eq!(ua.status().state(), RegistrationState::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_registration_drives_watchdog() {
        let ua = user_agent(Arc::new(RecordingEngine::default()));
        ua.start();

        ua.status().set_state(RegistrationState::Registered, None);
        for _ in 0..10 {
            if ua.watchdog().is_watching() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(ua.watchdog().is_watching());

        ua.status().set_state(RegistrationState::Unregistering, None);
        for _ in 0..10 {
            if !ua.watchdog().is_watching() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!ua.watchdog().is_watching());

        ua.shutdown().await;
    }
}
