//! SIP Transaction Layer
//!
//! Non-INVITE client transactions as per RFC 3261 Section 17.1.2. The user
//! agent only originates SUBSCRIBE and OPTIONS; incoming requests are answered
//! statelessly.

use super::dialog::Dialog;
use super::handler::RequestEvent;
use super::message::{SipError, SipRequest, SipResponse};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Transaction ID - uniquely identifies a transaction
/// Based on branch parameter in Via header
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    /// Create transaction ID from branch parameter
    pub fn from_branch(branch: &str) -> Self {
        Self(branch.to_string())
    }

    /// Generate a new transaction ID
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        Self(format!("z9hG4bK{:x}", random))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timers of a non-INVITE client transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Timer E: Non-INVITE request retransmit (default: T1)
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (default: 64*T1)
    TimerF,
    /// Timer K: Wait time for response retransmits (default: T4 for UDP, 0s for TCP)
    TimerK,
}

impl TimerType {
    pub fn default_duration(&self, timers: &SipTimers, is_reliable: bool) -> Duration {
        match self {
            TimerType::TimerE => timers.t1,
            TimerType::TimerF => timers.t1 * 64,
            TimerType::TimerK => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    timers.t4
                }
            }
        }
    }
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    /// Request sent, no response yet
    Trying,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received final response (2xx-6xx)
    Completed,
    /// Transaction terminated
    Terminated,
}

impl NonInviteClientState {
    pub fn name(&self) -> &'static str {
        match self {
            NonInviteClientState::Trying => "Trying",
            NonInviteClientState::Proceeding => "Proceeding",
            NonInviteClientState::Completed => "Completed",
            NonInviteClientState::Terminated => "Terminated",
        }
    }
}

/// Actions that should be taken when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimerAction {
    /// No action needed
    None,
    /// Retransmit the request
    RetransmitRequest,
    /// Transaction timed out
    Timeout,
    /// Terminate the transaction
    Terminate,
}

#[derive(Debug, Clone)]
struct ActiveTimer {
    timer_type: TimerType,
    expires_at: Instant,
    interval: Duration,
}

/// What a listener gets back about the transaction a response belongs to
#[derive(Debug, Clone)]
pub struct ClientTransaction {
    pub id: TransactionId,
    pub request: SipRequest,
}

/// Non-INVITE client transaction state machine
#[derive(Debug)]
pub struct NonInviteClientTransaction {
    pub id: TransactionId,
    pub state: NonInviteClientState,
    pub request: SipRequest,
    pub destination: SocketAddr,
    pub dialog: Option<Arc<Dialog>>,
    is_reliable: bool,
    timers: Vec<ActiveTimer>,
    sip_timers: SipTimers,
}

impl NonInviteClientTransaction {
    pub fn new(
        id: TransactionId,
        request: SipRequest,
        destination: SocketAddr,
        dialog: Option<Arc<Dialog>>,
        sip_timers: SipTimers,
    ) -> Self {
        let is_reliable = false;
        let mut transaction = Self {
            id,
            state: NonInviteClientState::Trying,
            request,
            destination,
            dialog,
            is_reliable,
            timers: Vec::new(),
            sip_timers,
        };

        // Start Timer E (request retransmit) and Timer F (timeout)
        transaction.start_timer(TimerType::TimerE);
        transaction.start_timer(TimerType::TimerF);

        transaction
    }

    pub fn handle(&self) -> ClientTransaction {
        ClientTransaction {
            id: self.id.clone(),
            request: self.request.clone(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == NonInviteClientState::Terminated
    }

    fn start_timer(&mut self, timer_type: TimerType) {
        let duration = timer_type.default_duration(&self.sip_timers, self.is_reliable);
        if duration.as_millis() > 0 {
            self.timers.push(ActiveTimer {
                timer_type,
                expires_at: Instant::now() + duration,
                interval: duration,
            });
            debug!(
                "Started {:?} for transaction {} (expires in {:?})",
                timer_type, self.id, duration
            );
        }
    }

    fn stop_timer(&mut self, timer_type: TimerType) {
        self.timers.retain(|t| t.timer_type != timer_type);
    }

    /// Feed a response. Returns true if it should be passed up to the listener.
    pub fn process_response(&mut self, response: &SipResponse) -> bool {
        let status = response.status_code();

        match self.state {
            NonInviteClientState::Trying | NonInviteClientState::Proceeding => {
                if (100..200).contains(&status) {
                    self.state = NonInviteClientState::Proceeding;
                    // Proceeding retransmits at T2
                    if let Some(timer) = self
                        .timers
                        .iter_mut()
                        .find(|t| t.timer_type == TimerType::TimerE)
                    {
                        timer.interval = self.sip_timers.t2;
                    }
                    false
                } else {
                    self.state = NonInviteClientState::Completed;
                    self.stop_timer(TimerType::TimerE);
                    self.stop_timer(TimerType::TimerF);
                    self.start_timer(TimerType::TimerK);
                    if self.timers.is_empty() {
                        self.state = NonInviteClientState::Terminated;
                    }
                    true
                }
            }
            // Absorb retransmitted responses
            NonInviteClientState::Completed | NonInviteClientState::Terminated => false,
        }
    }

    /// Handle timer expiration
    pub fn handle_timer_fired(&mut self, timer_type: TimerType) -> TransactionTimerAction {
        debug!(
            "Timer {:?} fired for transaction {} in state {}",
            timer_type,
            self.id,
            self.state.name()
        );

        match timer_type {
            TimerType::TimerE => {
                if matches!(
                    self.state,
                    NonInviteClientState::Trying | NonInviteClientState::Proceeding
                ) {
                    let t2 = self.sip_timers.t2;
                    let proceeding = self.state == NonInviteClientState::Proceeding;
                    if let Some(timer) = self
                        .timers
                        .iter_mut()
                        .find(|t| t.timer_type == TimerType::TimerE)
                    {
                        // Double the interval (exponential backoff), capped at T2
                        timer.interval = if proceeding {
                            t2
                        } else {
                            std::cmp::min(timer.interval * 2, t2)
                        };
                        timer.expires_at = Instant::now() + timer.interval;
                    }
                    TransactionTimerAction::RetransmitRequest
                } else {
                    TransactionTimerAction::None
                }
            }

            TimerType::TimerF => {
                self.state = NonInviteClientState::Terminated;
                self.timers.clear();
                TransactionTimerAction::Timeout
            }

            TimerType::TimerK => {
                self.state = NonInviteClientState::Terminated;
                self.timers.clear();
                TransactionTimerAction::Terminate
            }
        }
    }

    /// Check for expired timers and return actions
    pub fn check_timers(&mut self, now: Instant) -> Vec<TransactionTimerAction> {
        let expired: Vec<TimerType> = self
            .timers
            .iter()
            .filter(|t| t.expires_at <= now)
            .map(|t| t.timer_type)
            .collect();

        let mut actions = Vec::new();
        for timer_type in expired {
            if self.is_terminated() {
                break;
            }
            let action = self.handle_timer_fired(timer_type);
            if action != TransactionTimerAction::None {
                actions.push(action);
            }
        }
        actions
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.expires_at).min()
    }
}

/// The transaction engine the core sends through
///
/// Sends are fire-and-forget: the outcome arrives later through the
/// `SipListener` callbacks.
#[async_trait]
pub trait TransactionEngine: Send + Sync {
    /// Send `request` on a new client transaction, inside `dialog` if given
    async fn send_request(
        &self,
        request: SipRequest,
        dialog: Option<Arc<Dialog>>,
    ) -> Result<TransactionId, SipError>;

    /// Answer a received request
    async fn send_response(&self, event: &RequestEvent, response: SipResponse)
        -> Result<(), SipError>;

    /// Abandon a client transaction; its response, if any, is dropped
    async fn cancel(&self, id: &TransactionId);

    /// Send a CRLF keep-alive over the open transport
    async fn send_keep_alive(&self) -> Result<(), SipError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::dialog::tests::{ok_response, subscribe_request};

    fn transaction() -> NonInviteClientTransaction {
        NonInviteClientTransaction::new(
            TransactionId::generate(),
            subscribe_request("tx@host"),
            "127.0.0.1:5060".parse().unwrap(),
            None,
            SipTimers::default(),
        )
    }

    #[test]
    fn test_transaction_id() {
        let id = TransactionId::generate();
        assert!(id.0.starts_with("z9hG4bK"));
        assert_ne!(id, TransactionId::generate());
    }

    #[test]
    fn test_timer_durations() {
        let timers = SipTimers::default();
        assert_eq!(TimerType::TimerE.default_duration(&timers, false), Duration::from_millis(500));
        assert_eq!(TimerType::TimerF.default_duration(&timers, false), Duration::from_secs(32));
        assert_eq!(TimerType::TimerK.default_duration(&timers, false), Duration::from_secs(5));
        assert_eq!(TimerType::TimerK.default_duration(&timers, true), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_response_completes_and_absorbs_retransmits() {
        let mut tx = transaction();
        let response = ok_response("tx@host");

        assert!(tx.process_response(&response));
        assert_eq!(tx.state, NonInviteClientState::Completed);
        assert!(!tx.process_response(&response));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            tx.check_timers(Instant::now()),
            vec![TransactionTimerAction::Terminate]
        );
        assert!(tx.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_then_timeout() {
        let mut tx = transaction();

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(
            tx.check_timers(Instant::now()),
            vec![TransactionTimerAction::RetransmitRequest]
        );

        tokio::time::advance(Duration::from_secs(32)).await;
        let actions = tx.check_timers(Instant::now());
        assert!(actions.contains(&TransactionTimerAction::Timeout));
        assert!(tx.is_terminated());
    }
}
