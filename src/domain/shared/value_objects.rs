//! Shared value objects used across the signaling core

use super::error::DomainError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// SIP address (name-addr or bare addr-spec)
///
/// Two addresses are equal when their URIs are equal; the display name is
/// presentation only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipAddress {
    display_name: Option<String>,
    uri: String,
}

impl SipAddress {
    /// Parse `"Alice" <sip:alice@example.com>` or `sip:alice@example.com`
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DomainError::InvalidAddress("empty address".to_string()));
        }

        let (display_name, uri) = match (input.find('<'), input.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let name = input[..open].trim().trim_matches('"').trim();
                let name = if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                };
                (name, input[open + 1..close].trim())
            }
            (None, None) => (None, input),
            _ => {
                return Err(DomainError::InvalidAddress(format!(
                    "unbalanced angle brackets in '{}'",
                    input
                )))
            }
        };

        let uri = Self::normalize_uri(uri)?;
        Ok(Self { display_name, uri })
    }

    pub fn from_uri(uri: &str) -> Result<Self, DomainError> {
        Ok(Self {
            display_name: None,
            uri: Self::normalize_uri(uri)?,
        })
    }

    fn normalize_uri(uri: &str) -> Result<String, DomainError> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidAddress(format!("missing scheme in '{}'", uri)))?;

        let scheme = scheme.to_ascii_lowercase();
        if !matches!(scheme.as_str(), "sip" | "sips" | "tel") {
            return Err(DomainError::InvalidAddress(format!(
                "unsupported scheme '{}'",
                scheme
            )));
        }

        let host_part = rest.rsplit('@').next().unwrap_or(rest);
        let host = host_part.split([';', '?', ':']).next().unwrap_or("");
        if host.is_empty() || rest.contains(char::is_whitespace) {
            return Err(DomainError::InvalidAddress(format!("invalid URI '{}'", uri)));
        }

        Ok(format!("{}:{}", scheme, rest))
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Host (and port, if any) of the URI
    pub fn host_port(&self) -> &str {
        let rest = self.uri.split_once(':').map(|(_, r)| r).unwrap_or(&self.uri);
        let host_part = rest.rsplit('@').next().unwrap_or(rest);
        host_part.split([';', '?']).next().unwrap_or(host_part)
    }

    /// Render as a name-addr suitable for From/To headers
    pub fn to_name_addr(&self) -> String {
        match &self.display_name {
            Some(name) => format!("\"{}\" <{}>", name, self.uri),
            None => format!("<{}>", self.uri),
        }
    }
}

impl PartialEq for SipAddress {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for SipAddress {}

impl Hash for SipAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl fmt::Display for SipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_name_addr())
    }
}

/// SIP Call-ID header value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh Call-ID scoped to `host`
    pub fn generate(host: &str) -> Self {
        Self(format!("{}@{}", Uuid::new_v4().simple(), host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dialog identifier (RFC 3261 Section 12): Call-ID plus both tags
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: CallId,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: CallId, local_tag: impl Into<String>, remote_tag: impl Into<String>) -> Self {
        Self {
            call_id,
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Opaque handle of one tracked subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a From/To tag
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_addr() {
        let addr = SipAddress::parse("\"Alice\" <sip:alice@example.com>").unwrap();
        assert_eq!(addr.display_name(), Some("Alice"));
        assert_eq!(addr.uri(), "sip:alice@example.com");
        assert_eq!(addr.host_port(), "example.com");
    }

    #[test]
    fn test_parse_addr_spec_normalizes_scheme() {
        let addr = SipAddress::parse("SIP:bob@example.com:5070;transport=udp").unwrap();
        assert_eq!(addr.uri(), "sip:bob@example.com:5070;transport=udp");
        assert_eq!(addr.host_port(), "example.com:5070");
    }

    #[test]
    fn test_equality_ignores_display_name() {
        let a = SipAddress::parse("\"Bob\" <sip:bob@example.com>").unwrap();
        let b = SipAddress::parse("sip:bob@example.com").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(SipAddress::parse("").is_err());
        assert!(SipAddress::parse("bob@example.com").is_err());
        assert!(SipAddress::parse("http://example.com").is_err());
        assert!(SipAddress::parse("<sip:bob@example.com").is_err());
        assert!(SipAddress::parse("sip:bob@").is_err());
    }

    #[test]
    fn test_generated_call_ids_are_unique() {
        let a = CallId::generate("example.com");
        let b = CallId::generate("example.com");
        assert_ne!(a, b);
        assert!(a.as_str().ends_with("@example.com"));
    }
}
