//! Callbacks from the SIP stack to the user agent

use super::dialog::Dialog;
use super::message::{SipRequest, SipResponse};
use super::transaction::{ClientTransaction, TransactionId};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

/// An incoming request and the dialog it belongs to, if any
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request: SipRequest,
    pub source: SocketAddr,
    pub dialog: Option<Arc<Dialog>>,
}

/// A final response matched to the client transaction that sent the request
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub response: SipResponse,
    pub transaction: ClientTransaction,
    pub dialog: Option<Arc<Dialog>>,
}

/// A client transaction that never got a final response
#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub transaction: ClientTransaction,
}

/// A send or receive failure on the transport
#[derive(Debug, Clone)]
pub struct IoErrorEvent {
    pub transaction: Option<TransactionId>,
    pub reason: String,
}

/// Receives everything the stack observes
#[async_trait]
pub trait SipListener: Send + Sync {
    async fn on_request(&self, event: RequestEvent);

    async fn on_response(&self, event: ResponseEvent);

    async fn on_timeout(&self, event: TimeoutEvent);

    async fn on_io_error(&self, event: IoErrorEvent);

    /// Any datagram arrived, including bare CRLF keep-alive answers
    fn on_traffic(&self) {}
}
