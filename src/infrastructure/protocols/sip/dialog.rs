//! SIP dialogs (RFC 3261 Section 12)
//!
//! Only UAC dialogs are created here: the user agent establishes dialogs with
//! SUBSCRIBE and learns about the far end's dialogs through the requests it
//! receives inside them.

use super::headers;
use super::message::{SipError, SipRequest, SipResponse};
use crate::domain::shared::{CallId, DialogId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug)]
pub struct Dialog {
    id: DialogId,
    state: Mutex<DialogState>,
    /// From header value without tag
    local_address: String,
    /// To header value without tag
    remote_address: String,
    remote_target: Mutex<String>,
    route_set: Vec<String>,
    local_cseq: AtomicU32,
    auto_terminate_on_bye: AtomicBool,
}

impl Dialog {
    /// Build the UAC side of a dialog from the request and the response that established it
    pub fn new_uac(request: &SipRequest, response: &SipResponse) -> Result<Self, SipError> {
        let call_id = response
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("Missing Call-ID".to_string()))?;
        let local_tag = request
            .from_tag()
            .ok_or_else(|| SipError::InvalidMessage("Missing From tag".to_string()))?;
        let remote_tag = response
            .to_tag()
            .ok_or_else(|| SipError::InvalidMessage("Missing To tag".to_string()))?;
        let local_address = request
            .header("From")
            .map(|v| headers::without_tag(&v))
            .ok_or_else(|| SipError::InvalidMessage("Missing From".to_string()))?;
        let remote_address = response
            .header("To")
            .map(|v| headers::without_tag(&v))
            .ok_or_else(|| SipError::InvalidMessage("Missing To".to_string()))?;

        let remote_target = response
            .header("Contact")
            .map(|c| headers::uri_of(&c))
            .unwrap_or_else(|| request.uri());

        // UAC route set is the Record-Route list in reverse order
        let mut route_set: Vec<String> = headers::find_all(response.headers(), "Record-Route")
            .iter()
            .flat_map(|v| v.split(',').map(|r| r.trim().to_string()).collect::<Vec<_>>())
            .collect();
        route_set.reverse();

        let state = if response.is_success() {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };

        Ok(Self {
            id: DialogId::new(CallId::new(call_id), local_tag, remote_tag),
            state: Mutex::new(state),
            local_address,
            remote_address,
            remote_target: Mutex::new(remote_target),
            route_set,
            local_cseq: AtomicU32::new(request.cseq().map(|c| c.seq).unwrap_or(1)),
            auto_terminate_on_bye: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn call_id(&self) -> &CallId {
        &self.id.call_id
    }

    pub fn state(&self) -> DialogState {
        *self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == DialogState::Terminated
    }

    pub fn confirm(&self) {
        let mut state = self.state.lock();
        if *state == DialogState::Early {
            *state = DialogState::Confirmed;
        }
    }

    /// Move to Terminated. Returns false if it already was.
    pub fn terminate(&self) -> bool {
        let mut state = self.state.lock();
        if *state == DialogState::Terminated {
            return false;
        }
        *state = DialogState::Terminated;
        debug!("Dialog {} terminated", self.id);
        true
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn remote_target(&self) -> String {
        self.remote_target.lock().clone()
    }

    /// Target refresh (Contact of a 2xx or an in-dialog request)
    pub fn set_remote_target(&self, target: String) {
        *self.remote_target.lock() = target;
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    /// Allocate the CSeq for the next in-dialog request
    pub fn next_cseq(&self) -> u32 {
        self.local_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Keep the dialog alive across a BYE. Fails once the dialog is terminated.
    pub fn suppress_auto_termination(&self) -> bool {
        let state = self.state.lock();
        if *state == DialogState::Terminated {
            return false;
        }
        self.auto_terminate_on_bye.store(false, Ordering::SeqCst);
        true
    }

    pub fn auto_terminates_on_bye(&self) -> bool {
        self.auto_terminate_on_bye.load(Ordering::SeqCst)
    }
}

/// Live dialogs of one stack, keyed by dialog id
#[derive(Debug, Default)]
pub struct DialogTable {
    dialogs: DashMap<DialogId, Arc<Dialog>>,
}

impl DialogTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialog for a 2xx to a dialog-creating request, creating it on first sight
    pub fn establish(
        &self,
        request: &SipRequest,
        response: &SipResponse,
    ) -> Result<Arc<Dialog>, SipError> {
        let dialog = Dialog::new_uac(request, response)?;
        let entry = self
            .dialogs
            .entry(dialog.id().clone())
            .or_insert_with(|| Arc::new(dialog));
        let dialog = entry.value().clone();
        drop(entry);

        dialog.confirm();
        if let Some(contact) = response.header("Contact") {
            dialog.set_remote_target(headers::uri_of(&contact));
        }
        Ok(dialog)
    }

    /// Dialog an incoming request belongs to
    pub fn find_for_request(&self, request: &SipRequest) -> Option<Arc<Dialog>> {
        let id = DialogId::new(
            CallId::new(request.call_id()?),
            request.to_tag()?,
            request.from_tag()?,
        );
        self.get(&id)
    }

    /// Live dialog by id. Terminated dialogs are purged on lookup.
    pub fn get(&self, id: &DialogId) -> Option<Arc<Dialog>> {
        let dialog = self.dialogs.get(id).map(|d| d.value().clone())?;
        if dialog.is_terminated() {
            self.dialogs.remove(id);
            return None;
        }
        Some(dialog)
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    pub fn clear(&self) {
        self.dialogs.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn subscribe_request(call_id: &str) -> SipRequest {
        let data = format!(
            "SUBSCRIBE sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKsub1\r\n\
             From: \"Alice\" <sip:alice@example.com>;tag=ua1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 SUBSCRIBE\r\n\
             Event: presence\r\n\
             Expires: 3600\r\n\
             Content-Length: 0\r\n\r\n",
            call_id
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    pub(crate) fn ok_response(call_id: &str) -> SipResponse {
        let data = format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKsub1\r\n\
             From: \"Alice\" <sip:alice@example.com>;tag=ua1\r\n\
             To: <sip:bob@example.com>;tag=srv1\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 SUBSCRIBE\r\n\
             Contact: <sip:bob@10.0.0.2:5060>\r\n\
             Record-Route: <sip:p1.example.com;lr>\r\n\
             Record-Route: <sip:p2.example.com;lr>\r\n\
             Expires: 3600\r\n\
             Content-Length: 0\r\n\r\n",
            call_id
        );
        SipResponse::parse(data.as_bytes()).unwrap()
    }

    /// A confirmed dialog for tests that only need a live dialog
    pub(crate) fn test_dialog(call_id: &str) -> Arc<Dialog> {
        Arc::new(Dialog::new_uac(&subscribe_request(call_id), &ok_response(call_id)).unwrap())
    }

    #[test]
    fn test_uac_dialog_from_2xx() {
        let dialog = test_dialog("d1@host");
        assert_eq!(dialog.state(), DialogState::Confirmed);
        assert_eq!(dialog.id().local_tag, "ua1");
        assert_eq!(dialog.id().remote_tag, "srv1");
        assert_eq!(dialog.remote_target(), "sip:bob@10.0.0.2:5060");
        assert_eq!(
            dialog.route_set(),
            &["<sip:p2.example.com;lr>".to_string(), "<sip:p1.example.com;lr>".to_string()]
        );
        assert_eq!(dialog.next_cseq(), 2);
        assert_eq!(dialog.next_cseq(), 3);
    }

    #[test]
    fn test_suppress_fails_once_terminated() {
        let dialog = test_dialog("d2@host");
        assert!(dialog.suppress_auto_termination());
        assert!(!dialog.auto_terminates_on_bye());
        assert!(dialog.terminate());
        assert!(!dialog.terminate());
        assert!(!dialog.suppress_auto_termination());
    }

    #[test]
    fn test_table_reuses_and_purges() {
        let table = DialogTable::new();
        let request = subscribe_request("d3@host");
        let response = ok_response("d3@host");

        let first = table.establish(&request, &response).unwrap();
        let second = table.establish(&request, &response).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);

        first.terminate();
        assert!(table.get(first.id()).is_none());
        assert!(table.is_empty());
    }
}
