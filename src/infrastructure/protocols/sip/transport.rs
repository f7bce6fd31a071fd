//! SIP transport layer - UDP

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// RFC 5626 CRLF keep-alive ping
pub const CRLF_KEEP_ALIVE: &[u8] = b"\r\n\r\n";

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Outgoing datagram with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// What the receive loop reports
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(IncomingMessage),
    /// Whitespace-only datagram (keep-alive ping or pong)
    KeepAlive(SocketAddr),
    /// Receive failed; the loop has stopped
    Failed(String),
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<TransportEvent>,
    rx: Option<mpsc::Receiver<TransportEvent>>,
    receive_task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx: Some(rx),
            receive_task: None,
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<TransportEvent>) {
        let mut buf = vec![0u8; 65535];

        loop {
            let event = match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    let data = &buf[..size];

                    if data.iter().all(|b| b.is_ascii_whitespace()) {
                        TransportEvent::KeepAlive(source)
                    } else {
                        match SipMessage::parse(data) {
                            Ok(message) => TransportEvent::Message(IncomingMessage { message, source }),
                            Err(e) => {
                                warn!("Failed to parse SIP message from {}: {}", source, e);
                                continue;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    let _ = tx.send(TransportEvent::Failed(e.to_string())).await;
                    break;
                }
            };

            if let Err(e) = tx.send(event).await {
                error!("Failed to send incoming message to channel: {}", e);
                break;
            }
        }
    }

    /// Bind the socket and start receiving. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        // Start receive loop in background
        let tx = self.tx.clone();
        self.receive_task = Some(tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        }));

        Ok(local_addr)
    }

    pub fn stop(&mut self) {
        info!("Stopping UDP transport");
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        self.socket = None;
    }

    /// Hand the receive side to whoever dispatches incoming traffic
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.rx.take()
    }

    pub fn sender(&self) -> Result<UdpSender, SipError> {
        let socket = self
            .socket
            .clone()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;
        Ok(UdpSender { socket })
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
    }
}

/// Cloneable send half of a started transport
#[derive(Debug, Clone)]
pub struct UdpSender {
    socket: Arc<UdpSocket>,
}

impl UdpSender {
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport_start() {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let mut transport = UdpTransport::new(bind_addr);

        let local = transport.start().await.unwrap();
        assert_ne!(local.port(), 0);
        assert!(transport.take_receiver().is_some());
        assert!(transport.take_receiver().is_none());

        transport.stop();
        assert!(transport.sender().is_err());
    }

    #[tokio::test]
    async fn test_keep_alive_datagram_is_reported() {
        let mut transport = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let local = transport.start().await.unwrap();
        let mut rx = transport.take_receiver().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(CRLF_KEEP_ALIVE, local).await.unwrap();

        match rx.recv().await {
            Some(TransportEvent::KeepAlive(source)) => {
                assert_eq!(source, peer.local_addr().unwrap())
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
