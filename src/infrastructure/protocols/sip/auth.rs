//! SIP Digest Authentication (RFC 2617, RFC 3261) - client side

use super::dialog::Dialog;
use super::message::{SipError, SipRequest, SipResponse};
use super::transaction::{ClientTransaction, TransactionEngine, TransactionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remembered (Call-ID, nonce) pairs before the set is reset
const MAX_TRACKED_NONCES: usize = 1024;

/// Answers 401/407 challenges by re-sending the request with credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    async fn handle_challenge(
        &self,
        transaction: &ClientTransaction,
        response: &SipResponse,
        dialog: Option<Arc<Dialog>>,
    ) -> Result<TransactionId, SipError>;
}

/// User credentials for authentication
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

/// Parsed WWW-Authenticate / Proxy-Authenticate challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let digest = value
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| SipError::Authentication(format!("Unsupported challenge: {}", value)))?;
        let params = parse_digest_params(digest);

        let algorithm = params
            .get("algorithm")
            .cloned()
            .unwrap_or_else(|| "MD5".to_string());
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(SipError::Authentication(format!(
                "Unsupported digest algorithm {}",
                algorithm
            )));
        }

        // Only qop=auth is supported; a challenge offering just auth-int is answered without qop
        let qop = params.get("qop").and_then(|offered| {
            offered
                .split(',')
                .map(str::trim)
                .find(|q| q.eq_ignore_ascii_case("auth"))
                .map(|q| q.to_string())
        });

        Ok(Self {
            realm: params
                .get("realm")
                .cloned()
                .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?,
            nonce: params
                .get("nonce")
                .cloned()
                .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?,
            algorithm,
            qop,
            opaque: params.get("opaque").cloned(),
        })
    }

    /// Authorization header value answering this challenge
    pub fn authorization(
        &self,
        credentials: &UserCredentials,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let nc = "00000001";
        let response = calculate_response(
            &credentials.username,
            &credentials.password,
            &self.realm,
            &self.nonce,
            method,
            uri,
            self.qop.as_deref().map(|qop| (qop, nc, cnonce)),
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            credentials.username, self.realm, self.nonce, uri, response, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

/// Split `key=value, key="quoted, value"` pairs
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut parts = Vec::new();

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// Calculate digest response; `qop` carries (qop, nc, cnonce)
fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    match qop {
        Some((qop, nc, cnonce)) => format!(
            "{:x}",
            md5::compute(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        ),
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Digest challenge handler for one account
pub struct DigestChallengeHandler {
    credentials: Option<UserCredentials>,
    transactions: Arc<dyn TransactionEngine>,
    answered: Mutex<HashSet<(String, String)>>,
}

impl DigestChallengeHandler {
    pub fn new(credentials: Option<UserCredentials>, transactions: Arc<dyn TransactionEngine>) -> Self {
        Self {
            credentials,
            transactions,
            answered: Mutex::new(HashSet::new()),
        }
    }

    /// Build the authenticated copy of `transaction`'s request
    fn authenticate(
        &self,
        transaction: &ClientTransaction,
        response: &SipResponse,
        dialog: Option<&Dialog>,
    ) -> Result<SipRequest, SipError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            SipError::Authentication("Challenged but no credentials configured".to_string())
        })?;

        let status = response.status_code();
        let (challenge_header, authorization_header) = match status {
            401 => ("WWW-Authenticate", "Authorization"),
            407 => ("Proxy-Authenticate", "Proxy-Authorization"),
            _ => {
                return Err(SipError::Authentication(format!(
                    "{} is not a challenge",
                    status
                )))
            }
        };

        let challenge = response
            .header(challenge_header)
            .ok_or_else(|| SipError::Authentication(format!("Missing {}", challenge_header)))
            .and_then(|v| AuthChallenge::parse(&v))?;

        let call_id = transaction.request.call_id().unwrap_or_default();
        {
            let mut answered = self.answered.lock();
            if !answered.insert((call_id.clone(), challenge.nonce.clone())) {
                warn!("Repeated challenge for nonce {} on {}, credentials rejected", challenge.nonce, call_id);
                return Err(SipError::Authentication(format!(
                    "Credentials rejected by realm {}",
                    challenge.realm
                )));
            }
            if answered.len() > MAX_TRACKED_NONCES {
                answered.clear();
                answered.insert((call_id, challenge.nonce.clone()));
            }
        }

        let mut request = transaction.request.clone();
        let method = request.method_name();
        let uri = request.uri();
        request.set_header(
            authorization_header,
            challenge.authorization(credentials, &method, &uri, &generate_cnonce()),
        );

        let seq = match dialog {
            Some(dialog) => dialog.next_cseq(),
            None => request.cseq().map(|c| c.seq + 1).unwrap_or(1),
        };
        request.set_cseq(seq);
        request.set_branch(&TransactionId::generate().0);

        debug!("Answering {} challenge from realm {}", status, challenge.realm);
        Ok(request)
    }
}

#[async_trait]
impl ChallengeHandler for DigestChallengeHandler {
    async fn handle_challenge(
        &self,
        transaction: &ClientTransaction,
        response: &SipResponse,
        dialog: Option<Arc<Dialog>>,
    ) -> Result<TransactionId, SipError> {
        let request = self.authenticate(transaction, response, dialog.as_deref())?;
        let id = self.transactions.send_request(request, dialog).await?;
        info!("Re-sent request with credentials on transaction {}", id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::dialog::tests::subscribe_request;
    use crate::infrastructure::protocols::sip::handler::RequestEvent;

    struct NullEngine;

    #[async_trait]
    impl TransactionEngine for NullEngine {
        async fn send_request(
            &self,
            request: SipRequest,
            _dialog: Option<Arc<Dialog>>,
        ) -> Result<TransactionId, SipError> {
            Ok(TransactionId::from_branch(&request.branch().unwrap_or_default()))
        }

        async fn send_response(&self, _event: &RequestEvent, _response: SipResponse) -> Result<(), SipError> {
            Ok(())
        }

        async fn cancel(&self, _id: &TransactionId) {}

        async fn send_keep_alive(&self) -> Result<(), SipError> {
            Ok(())
        }
    }

    fn challenge(status: u16, header: &str) -> SipResponse {
        let reason = if status == 401 { "Unauthorized" } else { "Proxy Authentication Required" };
        let data = format!(
            "SIP/2.0 {} {}\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKsub1\r\n\
             From: \"Alice\" <sip:alice@example.com>;tag=ua1\r\n\
             To: <sip:bob@example.com>;tag=srv1\r\n\
             Call-ID: auth@host\r\n\
             CSeq: 1 SUBSCRIBE\r\n\
             {}: Digest realm=\"example.com\", nonce=\"abc123\", qop=\"auth,auth-int\", opaque=\"xyz\"\r\n\
             Content-Length: 0\r\n\r\n",
            status, reason, header
        );
        SipResponse::parse(data.as_bytes()).unwrap()
    }

    fn handler(credentials: Option<UserCredentials>) -> DigestChallengeHandler {
        DigestChallengeHandler::new(credentials, Arc::new(NullEngine))
    }

    fn alice() -> Option<UserCredentials> {
        Some(UserCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        })
    }

    fn transaction() -> ClientTransaction {
        ClientTransaction {
            id: TransactionId::from_branch("z9hG4bKsub1"),
            request: subscribe_request("auth@host"),
        }
    }

    #[test]
    fn test_parse_challenge() {
        let challenge =
            AuthChallenge::parse(r#"Digest realm="example.com", nonce="n1", qop="auth,auth-int""#)
                .unwrap();
        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.nonce, "n1");
        assert_eq!(challenge.algorithm, "MD5");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));

        assert!(AuthChallenge::parse(r#"Basic realm="x""#).is_err());
        assert!(AuthChallenge::parse(r#"Digest realm="x", nonce="n", algorithm=SHA-256"#).is_err());
    }

    #[test]
    fn test_rfc2617_response() {
        // Example from RFC 2617 Section 3.5
        let response = calculate_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some(("auth", "00000001", "0a4f113b")),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[tokio::test]
    async fn test_challenge_resends_with_credentials() {
        let handler = handler(alice());
        let original = transaction();

        let request = handler
            .authenticate(&original, &challenge(407, "Proxy-Authenticate"), None)
            .unwrap();

        assert_eq!(request.cseq().unwrap().seq, 2);
        assert_ne!(request.branch(), original.request.branch());
        let authorization = request.header("Proxy-Authorization").unwrap();
        assert!(authorization.contains(r#"username="alice""#));
        assert!(authorization.contains("qop=auth"));
        assert!(authorization.contains(r#"opaque="xyz""#));

        let id = handler
            .handle_challenge(&original, &challenge(401, "WWW-Authenticate"), None)
            .await;
        // Same nonce on the same Call-ID was already answered
        assert!(matches!(id, Err(SipError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail() {
        let result = handler(None)
            .handle_challenge(&transaction(), &challenge(401, "WWW-Authenticate"), None)
            .await;
        assert!(matches!(result, Err(SipError::Authentication(_))));
    }
}
