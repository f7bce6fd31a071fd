//! SIP message types and parsing

use super::headers::{self, CSeq};
use bytes::Bytes;
use rsip::{Header, Headers, Request, Response};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SipError {
    /// Whether the error came from the network rather than from message handling
    pub fn is_network(&self) -> bool {
        matches!(self, SipError::TransportError(_))
    }
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// SIP methods the user agent sends or answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Subscribe,
    Notify,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    /// Request method name as it appears on the wire
    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_name(&self.method_name())
    }

    pub fn uri(&self) -> String {
        self.inner.uri.to_string()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// First value of the named header (long or compact form)
    pub fn header(&self, name: &str) -> Option<String> {
        headers::find(&self.inner.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| headers::param(&v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| headers::param(&v, "tag"))
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.header("CSeq").and_then(|v| CSeq::parse(&v))
    }

    pub fn branch(&self) -> Option<String> {
        self.header("Via").and_then(|v| headers::param(&v, "branch"))
    }

    pub fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// Replace every occurrence of `name` with a single `name: value`
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.inner.headers = headers::replace(&self.inner.headers, name, value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.inner.headers = headers::without(&self.inner.headers, name);
    }

    /// Rewrite the CSeq number, keeping the method
    pub fn set_cseq(&mut self, seq: u32) {
        let method = self.method_name();
        self.set_header("CSeq", format!("{} {}", seq, method));
    }

    /// Replace the branch parameter of the top Via
    pub fn set_branch(&mut self, branch: &str) {
        let rewritten: Vec<Header> = {
            let mut replaced = false;
            self.inner
                .headers
                .iter()
                .map(|h| {
                    let line = h.to_string();
                    match line.split_once(':') {
                        Some((name, value)) if !replaced && headers::name_matches(name, "Via") => {
                            replaced = true;
                            Header::Other(
                                "Via".into(),
                                headers::with_param(value.trim(), "branch", branch),
                            )
                        }
                        _ => h.clone(),
                    }
                })
                .collect()
        };
        self.inner.headers = Headers::from(rewritten);
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        headers::find(&self.inner.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| headers::param(&v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| headers::param(&v, "tag"))
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.header("CSeq").and_then(|v| CSeq::parse(&v))
    }

    pub fn branch(&self) -> Option<String> {
        self.header("Via").and_then(|v| headers::param(&v, "branch"))
    }

    pub fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.trim().parse().ok())
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Status lines start with the version, request lines never do
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }

        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY: &[u8] = b"NOTIFY sip:alice@192.168.1.100:5060 SIP/2.0\r\n\
                            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKnotify1\r\n\
                            From: <sip:bob@example.com>;tag=srv1\r\n\
                            To: <sip:alice@example.com>;tag=ua1\r\n\
                            Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                            CSeq: 7 NOTIFY\r\n\
                            Event: presence\r\n\
                            Subscription-State: active;expires=3599\r\n\
                            Content-Type: application/pidf+xml\r\n\
                            Content-Length: 5\r\n\r\n\
                            <xml>";

    #[test]
    fn test_parse_notify_request() {
        let msg = SipMessage::parse(NOTIFY).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Notify));
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com".to_string()));
        assert_eq!(req.from_tag(), Some("srv1".to_string()));
        assert_eq!(req.to_tag(), Some("ua1".to_string()));
        assert_eq!(req.branch(), Some("z9hG4bKnotify1".to_string()));
        assert_eq!(req.cseq().map(|c| c.seq), Some(7));
        assert_eq!(req.header("event"), Some("presence".to_string()));
        assert_eq!(req.body(), b"<xml>");
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 423 Interval Too Brief\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: <sip:bob@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 1 SUBSCRIBE\r\n\
                     Min-Expires: 1800\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_response());

        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 423);
        assert_eq!(resp.header("Min-Expires"), Some("1800".to_string()));
        assert_eq!(resp.cseq().unwrap().method, "SUBSCRIBE");
    }

    #[test]
    fn test_rewrite_cseq_and_branch() {
        let mut req = SipRequest::parse(NOTIFY).unwrap();
        req.set_cseq(8);
        req.set_branch("z9hG4bKfresh");
        req.set_header("Expires", "0");

        let reparsed = SipRequest::parse(&req.to_bytes()).unwrap();
        assert_eq!(reparsed.cseq().map(|c| c.seq), Some(8));
        assert_eq!(reparsed.branch(), Some("z9hG4bKfresh".to_string()));
        assert_eq!(reparsed.expires(), Some(0));
    }
}
