//! Bundled UDP SIP stack
//!
//! Sends every request to one next hop (registrar or outbound proxy), runs
//! the non-INVITE client transactions, keeps the dialog table and dispatches
//! what it observes to a `SipListener`.

use super::dialog::{Dialog, DialogTable};
use super::handler::{IoErrorEvent, RequestEvent, ResponseEvent, SipListener, TimeoutEvent};
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transaction::{
    ClientTransaction, NonInviteClientTransaction, SipTimers, TransactionEngine, TransactionId,
    TransactionTimerAction,
};
use super::transport::{
    IncomingMessage, OutgoingMessage, TransportEvent, UdpSender, UdpTransport, CRLF_KEEP_ALIVE,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Transaction timers are polled at this cadence
const TIMER_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SipStackConfig {
    pub bind_addr: SocketAddr,
    /// Next hop for every request
    pub server_addr: SocketAddr,
    pub timers: SipTimers,
}

type TransactionTable = Arc<RwLock<HashMap<TransactionId, NonInviteClientTransaction>>>;

pub struct SipStack {
    sender: UdpSender,
    local_addr: SocketAddr,
    server_addr: SocketAddr,
    timers: SipTimers,
    transactions: TransactionTable,
    dialogs: Arc<DialogTable>,
    transport: parking_lot::Mutex<UdpTransport>,
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SipStack {
    /// Bind the UDP socket. Nothing is dispatched until `start`.
    pub async fn bind(config: SipStackConfig) -> Result<Arc<Self>, SipError> {
        let mut transport = UdpTransport::new(config.bind_addr);
        let local_addr = transport.start().await?;
        let receiver = transport.take_receiver();
        let sender = transport.sender()?;

        Ok(Arc::new(Self {
            sender,
            local_addr,
            server_addr: config.server_addr,
            timers: config.timers,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            dialogs: Arc::new(DialogTable::new()),
            transport: parking_lot::Mutex::new(transport),
            receiver: parking_lot::Mutex::new(receiver),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dialogs(&self) -> &Arc<DialogTable> {
        &self.dialogs
    }

    /// Start dispatching to `listener`
    pub fn start(&self, listener: Arc<dyn SipListener>) -> Result<(), SipError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| SipError::Internal("SIP stack already started".to_string()))?;

        let receive_task = tokio::spawn(Self::dispatch_loop(
            receiver,
            self.transactions.clone(),
            self.dialogs.clone(),
            listener.clone(),
        ));
        let timer_task = tokio::spawn(Self::timer_loop(
            self.transactions.clone(),
            self.sender.clone(),
            listener,
        ));

        self.tasks.lock().extend([receive_task, timer_task]);
        info!("SIP stack started on {}", self.local_addr);
        Ok(())
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.lock().stop();
        self.transactions.write().await.clear();
        self.dialogs.clear();
        info!("SIP stack stopped");
    }

    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    async fn dispatch_loop(
        mut receiver: mpsc::Receiver<TransportEvent>,
        transactions: TransactionTable,
        dialogs: Arc<DialogTable>,
        listener: Arc<dyn SipListener>,
    ) {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::KeepAlive(source) => {
                    debug!("Keep-alive from {}", source);
                    listener.on_traffic();
                }
                TransportEvent::Failed(reason) => {
                    listener
                        .on_io_error(IoErrorEvent {
                            transaction: None,
                            reason,
                        })
                        .await;
                }
                TransportEvent::Message(IncomingMessage { message, source }) => {
                    listener.on_traffic();
                    match message {
                        SipMessage::Request(request) => {
                            let dialog = dialogs.find_for_request(&request);
                            debug!(
                                "Received {} from {} (in dialog: {})",
                                request.method_name(),
                                source,
                                dialog.is_some()
                            );
                            listener
                                .on_request(RequestEvent {
                                    request,
                                    source,
                                    dialog,
                                })
                                .await;
                        }
                        SipMessage::Response(response) => {
                            if let Some(event) =
                                Self::match_response(&transactions, &dialogs, response).await
                            {
                                listener.on_response(event).await;
                            }
                        }
                    }
                }
            }
        }
        debug!("SIP dispatch loop finished");
    }

    /// Run the response through its client transaction
    async fn match_response(
        transactions: &TransactionTable,
        dialogs: &DialogTable,
        response: SipResponse,
    ) -> Option<ResponseEvent> {
        let id = TransactionId::from_branch(&response.branch()?);

        let (transaction, tx_dialog) = {
            let mut txns = transactions.write().await;
            let Some(txn) = txns.get_mut(&id) else {
                debug!("Dropping stray {} response for {}", response.status_code(), id);
                return None;
            };
            if !txn.process_response(&response) {
                return None;
            }
            (txn.handle(), txn.dialog.clone())
        };

        let dialog = if response.is_success()
            && transaction.request.method() == Some(SipMethod::Subscribe)
            && response.to_tag().is_some()
        {
            match dialogs.establish(&transaction.request, &response) {
                Ok(dialog) => Some(dialog),
                Err(e) => {
                    warn!("Could not establish dialog from {}: {}", id, e);
                    tx_dialog
                }
            }
        } else {
            tx_dialog
        };

        Some(ResponseEvent {
            response,
            transaction,
            dialog,
        })
    }

    async fn timer_loop(
        transactions: TransactionTable,
        sender: UdpSender,
        listener: Arc<dyn SipListener>,
    ) {
        info!("Transaction timer task started");
        let mut ticker = tokio::time::interval(TIMER_TICK);

        loop {
            ticker.tick().await;

            let mut retransmits: Vec<OutgoingMessage> = Vec::new();
            let mut timeouts: Vec<ClientTransaction> = Vec::new();

            {
                let mut txns = transactions.write().await;
                let now = Instant::now();

                for txn in txns.values_mut() {
                    for action in txn.check_timers(now) {
                        match action {
                            TransactionTimerAction::RetransmitRequest => {
                                debug!("Transaction {} retransmit", txn.id);
                                retransmits.push(OutgoingMessage {
                                    data: txn.request.to_bytes(),
                                    destination: txn.destination,
                                });
                            }
                            TransactionTimerAction::Timeout => {
                                warn!("Transaction {} timed out", txn.id);
                                timeouts.push(txn.handle());
                            }
                            TransactionTimerAction::Terminate | TransactionTimerAction::None => {}
                        }
                    }
                }

                txns.retain(|_, txn| !txn.is_terminated());
            }

            for message in retransmits {
                if let Err(e) = sender.send(message).await {
                    warn!("Retransmission failed: {}", e);
                }
            }

            for transaction in timeouts {
                listener.on_timeout(TimeoutEvent { transaction }).await;
            }
        }
    }
}

#[async_trait]
impl TransactionEngine for SipStack {
    async fn send_request(
        &self,
        mut request: SipRequest,
        dialog: Option<Arc<Dialog>>,
    ) -> Result<TransactionId, SipError> {
        let id = match request.branch() {
            Some(branch) => TransactionId::from_branch(&branch),
            None => {
                let id = TransactionId::generate();
                request.set_branch(&id.0);
                id
            }
        };

        let data = request.to_bytes();
        let method = request.method_name();
        let transaction = NonInviteClientTransaction::new(
            id.clone(),
            request,
            self.server_addr,
            dialog,
            self.timers,
        );

        // Registered first so a fast response always finds its transaction
        self.transactions
            .write()
            .await
            .insert(id.clone(), transaction);

        let sent = self
            .sender
            .send(OutgoingMessage {
                data,
                destination: self.server_addr,
            })
            .await;

        if let Err(e) = sent {
            self.transactions.write().await.remove(&id);
            return Err(e);
        }

        debug!("Sent {} on transaction {}", method, id);
        Ok(id)
    }

    async fn send_response(
        &self,
        event: &RequestEvent,
        response: SipResponse,
    ) -> Result<(), SipError> {
        debug!(
            "Sending {} response to {}",
            response.status_code(),
            event.source
        );
        self.sender
            .send(OutgoingMessage {
                data: response.to_bytes(),
                destination: event.source,
            })
            .await
    }

    async fn cancel(&self, id: &TransactionId) {
        if self.transactions.write().await.remove(id).is_some() {
            debug!("Transaction {} abandoned", id);
        }
    }

    async fn send_keep_alive(&self) -> Result<(), SipError> {
        self.sender
            .send(OutgoingMessage {
                data: Bytes::from_static(CRLF_KEEP_ALIVE),
                destination: self.server_addr,
            })
            .await
    }
}
