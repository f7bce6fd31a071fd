//! Registration liveness watchdog
//!
//! While the account is registered, a probe goes out every interval: either
//! an OPTIONS to the account's own address or a bare CRLF over the open
//! transport. An OPTIONS probe left unanswered for two intervals with nothing
//! else heard from the server, or one that cannot be sent at all, is reported
//! to the connectivity signal.

use super::builder::MessageFactory;
use super::handler::{ResponseEvent, TimeoutEvent};
use super::headers::HeaderBag;
use super::message::SipMethod;
use super::transaction::{TransactionEngine, TransactionId};
use crate::domain::registration::{ConnectivitySignal, RegistrationState};
use crate::domain::shared::{CallId, SipAddress};
use crate::infrastructure::metrics;
use crate::infrastructure::scheduler::{TimerHandle, TimerScheduler};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How the watchdog probes the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAliveMethod {
    #[default]
    Options,
    Crlf,
}

impl KeepAliveMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeepAliveMethod::Options => "options",
            KeepAliveMethod::Crlf => "crlf",
        }
    }
}

impl fmt::Display for KeepAliveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub method: KeepAliveMethod,
    /// Zero disables the watchdog
    pub interval: Duration,
    /// False for registrar-less accounts
    pub has_registrar: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            method: KeepAliveMethod::Options,
            interval: Duration::from_secs(25),
            has_registrar: true,
        }
    }
}

/// State of one watching session, from REGISTERED to the next session end
struct WatchSession {
    id: u64,
    timer: TimerHandle,
    call_id: CallId,
    cseq: u32,
    last_receive: Instant,
    /// Oldest OPTIONS probe not yet answered
    unanswered_since: Option<Instant>,
    probe: Option<TransactionId>,
    escalated: bool,
}

enum TickAction {
    Probe { call_id: CallId, cseq: u32 },
    Heartbeat,
    Escalate,
    Idle,
}

struct WatchdogInner {
    config: WatchdogConfig,
    address: SipAddress,
    scheduler: Arc<TimerScheduler>,
    transactions: Arc<dyn TransactionEngine>,
    messages: Arc<dyn MessageFactory>,
    connectivity: Arc<dyn ConnectivitySignal>,
    session: Mutex<Option<WatchSession>>,
    next_session: AtomicU64,
}

/// Keep-alive watchdog bound to the registration lifecycle
#[derive(Clone)]
pub struct RegistrationWatchdog {
    inner: Arc<WatchdogInner>,
}

impl RegistrationWatchdog {
    pub fn new(
        config: WatchdogConfig,
        address: SipAddress,
        scheduler: Arc<TimerScheduler>,
        transactions: Arc<dyn TransactionEngine>,
        messages: Arc<dyn MessageFactory>,
        connectivity: Arc<dyn ConnectivitySignal>,
    ) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                config,
                address,
                scheduler,
                transactions,
                messages,
                connectivity,
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Start on REGISTERED, stop on any state that ends the session
    pub fn on_registration_state_changed(&self, state: RegistrationState) {
        if state == RegistrationState::Registered {
            self.start();
        } else if state.ends_session() {
            self.stop();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    fn start(&self) {
        let config = self.inner.config;
        if config.interval.is_zero() || !config.has_registrar {
            debug!("Keep-alive disabled for {}", self.inner.address);
            return;
        }

        let mut session = self.inner.session.lock();
        if session.is_some() {
            return;
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<WatchdogInner> = Arc::downgrade(&self.inner);
        let timer = self
            .inner
            .scheduler
            .schedule_repeating(config.interval, config.interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        RegistrationWatchdog { inner }.tick(id).await;
                    }
                }
            });

        *session = Some(WatchSession {
            id,
            timer,
            call_id: CallId::generate(self.inner.address.host_port()),
            cseq: 0,
            last_receive: Instant::now(),
            unanswered_since: None,
            probe: None,
            escalated: false,
        });
        info!(
            "Keep-alive watchdog started for {} ({} every {}s)",
            self.inner.address,
            config.method,
            config.interval.as_secs()
        );
    }

    /// Stop watching. Idempotent.
    pub fn stop(&self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.timer.cancel();
            info!("Keep-alive watchdog stopped for {}", self.inner.address);
        }
    }

    /// Something arrived from the server
    pub fn packet_received(&self) {
        if let Some(session) = self.inner.session.lock().as_mut() {
            session.last_receive = Instant::now();
        }
    }

    /// Consume the answer to an OPTIONS probe of the current session
    pub fn process_response(&self, event: &ResponseEvent) -> bool {
        let response = &event.response;
        let is_options = response
            .cseq()
            .map(|c| c.method == SipMethod::Options.as_str())
            .unwrap_or(false);
        if !is_options {
            return false;
        }

        let mut guard = self.inner.session.lock();
        let Some(session) = guard.as_mut() else {
            return false;
        };
        if response.call_id().as_deref() != Some(session.call_id.as_str()) {
            return false;
        }

        debug!("Keep-alive answered with {}", response.status_code());
        session.last_receive = Instant::now();
        session.unanswered_since = None;
        session.probe = None;
        true
    }

    /// A probe got no final response. Silence detection covers it.
    pub fn process_timeout(&self, event: &TimeoutEvent) -> bool {
        let request = &event.transaction.request;
        if request.method() != Some(SipMethod::Options) {
            return false;
        }
        let guard = self.inner.session.lock();
        let ours = guard
            .as_ref()
            .map(|s| request.call_id().as_deref() == Some(s.call_id.as_str()))
            .unwrap_or(false);
        if ours {
            debug!("Keep-alive OPTIONS {} timed out", event.transaction.id);
        }
        ours
    }

    async fn tick(&self, session_id: u64) {
        let action = self.decide(session_id);
        match action {
            TickAction::Probe { call_id, cseq } => self.send_probe(session_id, call_id, cseq).await,
            TickAction::Heartbeat => {
                metrics::record_keep_alive_probe(KeepAliveMethod::Crlf.as_str());
                if let Err(e) = self.inner.transactions.send_keep_alive().await {
                    warn!("CRLF keep-alive failed: {}", e);
                }
            }
            TickAction::Escalate => {
                warn!(
                    "No answer to keep-alive for {} in {}s, connection considered lost",
                    self.inner.address,
                    (self.inner.config.interval * 2).as_secs()
                );
                self.escalate();
            }
            TickAction::Idle => {}
        }
    }

    fn decide(&self, session_id: u64) -> TickAction {
        let interval = self.inner.config.interval;
        let mut guard = self.inner.session.lock();
        let Some(session) = guard.as_mut().filter(|s| s.id == session_id) else {
            return TickAction::Idle;
        };
        if session.escalated {
            return TickAction::Idle;
        }

        if self.inner.config.method == KeepAliveMethod::Crlf {
            return TickAction::Heartbeat;
        }

        let now = Instant::now();
        if let Some(since) = session.unanswered_since {
            let silent = session.last_receive < since;
            if silent && now.duration_since(since) >= interval * 2 {
                session.escalated = true;
                return TickAction::Escalate;
            }
        }

        session.cseq = session.cseq.wrapping_add(1).max(1);
        TickAction::Probe {
            call_id: session.call_id.clone(),
            cseq: session.cseq,
        }
    }

    async fn send_probe(&self, session_id: u64, call_id: CallId, cseq: u32) {
        let address = &self.inner.address;
        let mut request = match self
            .inner
            .messages
            .create_request(SipMethod::Options, address, None, HeaderBag::new())
        {
            Ok(request) => request,
            Err(e) => {
                warn!("Cannot build keep-alive OPTIONS for {}: {}", address, e);
                return;
            }
        };
        request.set_header("Call-ID", call_id.to_string());
        request.set_cseq(cseq);

        metrics::record_keep_alive_probe(KeepAliveMethod::Options.as_str());
        match self.inner.transactions.send_request(request, None).await {
            Ok(transaction) => {
                let sent_at = Instant::now();
                if let Some(session) = self.inner.session.lock().as_mut().filter(|s| s.id == session_id) {
                    session.unanswered_since.get_or_insert(sent_at);
                    session.probe = Some(transaction);
                }
            }
            Err(e) if e.is_network() => {
                warn!("Keep-alive OPTIONS for {} could not be sent: {}", address, e);
                let first = match self.inner.session.lock().as_mut() {
                    Some(session) if session.id == session_id && !session.escalated => {
                        session.escalated = true;
                        true
                    }
                    _ => false,
                };
                if first {
                    self.escalate();
                }
            }
            Err(e) => warn!("Keep-alive OPTIONS for {} failed: {}", address, e),
        }
    }

    fn escalate(&self) {
        metrics::record_connection_failure("keep_alive");
        self.inner.connectivity.notify_connection_failed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registration::MockConnectivitySignal;
    use crate::infrastructure::protocols::sip::builder::AccountMessageFactory;
    use crate::infrastructure::protocols::sip::handler::RequestEvent;
    use crate::infrastructure::protocols::sip::message::{SipError, SipRequest, SipResponse};
    use crate::infrastructure::protocols::sip::transaction::ClientTransaction;
    use crate::infrastructure::protocols::sip::dialog::Dialog;
    use async_trait::async_trait;

    #[derive(Default)]
    struct ProbeEngine {
        fail_with: Option<SipError>,
        sent: Mutex<Vec<SipRequest>>,
        keep_alives: AtomicU64,
    }

    #[async_trait]
    impl TransactionEngine for ProbeEngine {
        async fn send_request(
            &self,
            request: SipRequest,
            _dialog: Option<Arc<Dialog>>,
        ) -> Result<TransactionId, SipError> {
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            let id = TransactionId::from_branch(&request.branch().unwrap_or_default());
            self.sent.lock().push(request);
            Ok(id)
        }

        async fn send_response(&self, _event: &RequestEvent, _response: SipResponse) -> Result<(), SipError> {
            Ok(())
        }

        async fn cancel(&self, _id: &TransactionId) {}

        async fn send_keep_alive(&self) -> Result<(), SipError> {
            self.keep_alives.fetch_add(1, Ordering::SeqCst);
            Err(SipError::TransportError("unreachable".to_string()))
        }
    }

    fn watchdog(
        method: KeepAliveMethod,
        engine: Arc<ProbeEngine>,
        connectivity: MockConnectivitySignal,
    ) -> RegistrationWatchdog {
        let address = SipAddress::parse("sip:alice@example.com").unwrap();
        RegistrationWatchdog::new(
            WatchdogConfig {
                method,
                interval: Duration::from_secs(30),
                has_registrar: true,
            },
            address.clone(),
            Arc::new(TimerScheduler::new()),
            engine,
            Arc::new(AccountMessageFactory::new(address, "192.168.1.100:5060", "yakua-test")),
            Arc::new(connectivity),
        )
    }

    fn answer(request: &SipRequest) -> ResponseEvent {
        let response = SipResponse::parse(
            format!(
                "SIP/2.0 200 OK\r\n\
                 Via: SIP/2.0/UDP 192.168.1.100:5060;branch={}\r\n\
                 From: <sip:alice@example.com>;tag=a\r\n\
                 To: <sip:alice@example.com>;tag=b\r\n\
                 Call-ID: {}\r\n\
                 CSeq: {} OPTIONS\r\n\
                 Content-Length: 0\r\n\r\n",
                request.branch().unwrap(),
                request.call_id().unwrap(),
                request.cseq().unwrap().seq
            )
            .as_bytes(),
        )
        .unwrap();
        ResponseEvent {
            response,
            transaction: ClientTransaction {
                id: TransactionId::from_branch(&request.branch().unwrap()),
                request: request.clone(),
            },
            dialog: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_escalates_exactly_once() {
        let engine = Arc::new(ProbeEngine {
            fail_with: Some(SipError::TransportError("network unreachable".to_string())),
            ..Default::default()
        });
        let mut connectivity = MockConnectivitySignal::new();
        connectivity.expect_notify_connection_failed().times(1).return_const(());

        let dog = watchdog(KeepAliveMethod::Options, engine, connectivity);
        dog.on_registration_state_changed(RegistrationState::Registered);

        // First probe fails to send, then two silent intervals follow
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        dog.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_silent_interval_does_not_escalate() {
        let engine = Arc::new(ProbeEngine::default());
        let mut connectivity = MockConnectivitySignal::new();
        connectivity.expect_notify_connection_failed().times(0);

        let dog = watchdog(KeepAliveMethod::Options, engine.clone(), connectivity);
        dog.on_registration_state_changed(RegistrationState::Registered);

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(engine.sent.lock().len(), 2);
        dog.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probes_escalate() {
        let engine = Arc::new(ProbeEngine::default());
        let mut connectivity = MockConnectivitySignal::new();
        connectivity.expect_notify_connection_failed().times(1).return_const(());

        let dog = watchdog(KeepAliveMethod::Options, engine.clone(), connectivity);
        dog.on_registration_state_changed(RegistrationState::Registered);

        tokio::time::sleep(Duration::from_secs(150)).await;
        // Probes at 30s and 60s, escalation at 90s, nothing after
        assert_eq!(engine.sent.lock().len(), 2);
        dog.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_probes_keep_session_alive() {
        let engine = Arc::new(ProbeEngine::default());
        let mut connectivity = MockConnectivitySignal::new();
        connectivity.expect_notify_connection_failed().times(0);

        let dog = watchdog(KeepAliveMethod::Options, engine.clone(), connectivity);
        dog.on_registration_state_changed(RegistrationState::Registered);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            tokio::task::yield_now().await;
            let last = engine.sent.lock().last().cloned();
            if let Some(request) = last {
                assert!(dog.process_response(&answer(&request)));
            }
        }

        let sent = engine.sent.lock();
        assert!(sent.len() >= 4);
        let call_id = sent[0].call_id();
        assert!(sent.iter().all(|r| r.call_id() == call_id));
        let seqs: Vec<u32> = sent.iter().map(|r| r.cseq().unwrap().seq).collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        drop(sent);
        dog.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crlf_failures_are_only_logged() {
        let engine = Arc::new(ProbeEngine::default());
        let mut connectivity = MockConnectivitySignal::new();
        connectivity.expect_notify_connection_failed().times(0);

        let dog = watchdog(KeepAliveMethod::Crlf, engine.clone(), connectivity);
        dog.on_registration_state_changed(RegistrationState::Registered);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(engine.keep_alives.load(Ordering::SeqCst), 3);
        assert!(engine.sent.lock().is_empty());
        dog.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_end_stops_watching() {
        let engine = Arc::new(ProbeEngine::default());
        let dog = watchdog(KeepAliveMethod::Options, engine.clone(), MockConnectivitySignal::new());

        dog.on_registration_state_changed(RegistrationState::Registered);
        assert!(dog.is_watching());
        dog.on_registration_state_changed(RegistrationState::Unregistering);
        assert!(!dog.is_watching());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(engine.sent.lock().is_empty());
    }
}
