//! SIP message construction

use super::dialog::Dialog;
use super::headers::{self, HeaderBag};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::transaction::TransactionId;
use crate::domain::shared::{generate_tag, CallId, SipAddress};
use rsip::{Header, Headers, Response, StatusCode, Version};

/// Builds the requests and responses the user agent sends
pub trait MessageFactory: Send + Sync {
    /// Out-of-dialog request to `target` when `dialog` is None, in-dialog otherwise
    fn create_request(
        &self,
        method: SipMethod,
        target: &SipAddress,
        dialog: Option<&Dialog>,
        headers: HeaderBag,
    ) -> Result<SipRequest, SipError>;

    fn create_response(
        &self,
        request: &SipRequest,
        status_code: u16,
        headers: HeaderBag,
    ) -> Result<SipResponse, SipError>;
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            to_tag: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(Header::Other(name.to_string(), value.into()));
        self
    }

    /// Tag to put on To when the request arrived outside a dialog
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut out: Vec<Header> = Vec::new();

        // Copy essential headers from request
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            let values = headers::find_all(request.headers(), name);
            if values.is_empty() && name != "Via" {
                return Err(SipError::InvalidMessage(format!("Missing {} header", name)));
            }
            for value in values {
                let value = match (&self.to_tag, name) {
                    (Some(tag), "To") if headers::param(&value, "tag").is_none() => {
                        headers::with_param(&value, "tag", tag)
                    }
                    _ => value,
                };
                out.push(Header::Other(name.to_string(), value));
            }
        }

        out.extend(self.headers);
        out.push(Header::Other("Content-Length".to_string(), "0".to_string()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(out),
            body: Vec::new(),
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Message factory for one account over UDP
#[derive(Debug, Clone)]
pub struct AccountMessageFactory {
    local: SipAddress,
    /// `host:port` the stack is reachable at
    via_host: String,
    user_agent: String,
    outbound_proxy: Option<String>,
}

impl AccountMessageFactory {
    pub fn new(local: SipAddress, via_host: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            local,
            via_host: via_host.into(),
            user_agent: user_agent.into(),
            outbound_proxy: None,
        }
    }

    /// Preloaded route (loose routing) for out-of-dialog requests
    pub fn with_outbound_proxy(mut self, proxy: Option<String>) -> Self {
        self.outbound_proxy = proxy;
        self
    }

    pub fn local_address(&self) -> &SipAddress {
        &self.local
    }

    fn contact(&self) -> String {
        let user = self
            .local
            .uri()
            .split_once(':')
            .and_then(|(_, rest)| rest.split_once('@'))
            .map(|(user, _)| format!("{}@", user))
            .unwrap_or_default();
        format!("<sip:{}{}>", user, self.via_host)
    }
}

impl MessageFactory for AccountMessageFactory {
    fn create_request(
        &self,
        method: SipMethod,
        target: &SipAddress,
        dialog: Option<&Dialog>,
        extra: HeaderBag,
    ) -> Result<SipRequest, SipError> {
        let mut lines: Vec<String> = Vec::new();

        let (request_uri, from, to, call_id, cseq, routes) = match dialog {
            Some(dialog) => (
                dialog.remote_target(),
                format!("{};tag={}", dialog.local_address(), dialog.id().local_tag),
                format!("{};tag={}", dialog.remote_address(), dialog.id().remote_tag),
                dialog.call_id().to_string(),
                dialog.next_cseq(),
                dialog.route_set().to_vec(),
            ),
            None => (
                target.uri().to_string(),
                format!("{};tag={}", self.local.to_name_addr(), generate_tag()),
                target.to_name_addr(),
                CallId::generate(self.local.host_port()).to_string(),
                1,
                self.outbound_proxy
                    .iter()
                    .map(|p| format!("<{};lr>", p))
                    .collect(),
            ),
        };

        lines.push(format!("{} {} SIP/2.0", method, request_uri));
        lines.push(format!(
            "Via: SIP/2.0/UDP {};branch={};rport",
            self.via_host,
            TransactionId::generate()
        ));
        lines.push("Max-Forwards: 70".to_string());
        for route in routes {
            lines.push(format!("Route: {}", route));
        }
        lines.push(format!("From: {}", from));
        lines.push(format!("To: {}", to));
        lines.push(format!("Call-ID: {}", call_id));
        lines.push(format!("CSeq: {} {}", cseq, method));
        lines.push(format!("Contact: {}", self.contact()));
        lines.push(format!("User-Agent: {}", self.user_agent));
        for (name, value) in extra.iter() {
            lines.push(format!("{}: {}", name, value));
        }
        lines.push("Content-Length: 0".to_string());

        let text = format!("{}\r\n\r\n", lines.join("\r\n"));
        SipRequest::parse(text.as_bytes())
    }

    fn create_response(
        &self,
        request: &SipRequest,
        status_code: u16,
        extra: HeaderBag,
    ) -> Result<SipResponse, SipError> {
        let mut builder = ResponseBuilder::new(status_code).to_tag(generate_tag());
        for (name, value) in extra.iter() {
            builder = builder.header(name, value);
        }
        builder.build_for_request(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::dialog::tests::test_dialog;

    fn factory() -> AccountMessageFactory {
        AccountMessageFactory::new(
            SipAddress::parse("\"Alice\" <sip:alice@example.com>").unwrap(),
            "192.168.1.100:5060",
            "yakua-test",
        )
    }

    #[test]
    fn test_out_of_dialog_request() {
        let target = SipAddress::parse("sip:bob@example.com").unwrap();
        let request = factory()
            .create_request(
                SipMethod::Subscribe,
                &target,
                None,
                HeaderBag::new().with("Event", "presence").with("Expires", "3600"),
            )
            .unwrap();

        assert_eq!(request.method(), Some(SipMethod::Subscribe));
        assert_eq!(request.uri(), "sip:bob@example.com");
        assert_eq!(request.cseq().unwrap().seq, 1);
        assert!(request.from_tag().is_some());
        assert!(request.to_tag().is_none());
        assert!(request.branch().unwrap().starts_with("z9hG4bK"));
        assert!(request.call_id().unwrap().ends_with("@example.com"));
        assert_eq!(request.header("Event"), Some("presence".to_string()));
        assert_eq!(request.expires(), Some(3600));
    }

    #[test]
    fn test_in_dialog_request_uses_dialog_state() {
        let dialog = test_dialog("dlg@host");
        let target = SipAddress::parse("sip:bob@example.com").unwrap();
        let request = factory()
            .create_request(SipMethod::Subscribe, &target, Some(&dialog), HeaderBag::new())
            .unwrap();

        assert_eq!(request.uri(), "sip:bob@10.0.0.2:5060");
        assert_eq!(request.call_id(), Some("dlg@host".to_string()));
        assert_eq!(request.from_tag(), Some("ua1".to_string()));
        assert_eq!(request.to_tag(), Some("srv1".to_string()));
        assert_eq!(request.cseq().unwrap().seq, 2);
        assert_eq!(headers::find_all(request.headers(), "Route").len(), 2);
    }

    #[test]
    fn test_response_copies_dialog_headers() {
        let target = SipAddress::parse("sip:bob@example.com").unwrap();
        let request = factory()
            .create_request(SipMethod::Subscribe, &target, None, HeaderBag::new())
            .unwrap();

        let response = factory()
            .create_response(&request, 415, HeaderBag::new().with("Accept", "application/pidf+xml"))
            .unwrap();

        assert_eq!(response.status_code(), 415);
        assert_eq!(response.call_id(), request.call_id());
        assert!(response.to_tag().is_some());
        assert_eq!(response.header("Accept"), Some("application/pidf+xml".to_string()));
    }
}
