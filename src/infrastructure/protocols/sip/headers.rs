//! Header access by name and parsing of the header values the user agent inspects
//!
//! rsip only types a subset of headers, and its typed headers render as
//! `Name: value`. Everything here works on that rendering so typed and
//! `Header::Other` headers are handled the same way.

use rsip::{Header, Headers};

/// RFC 3261 compact header forms
const COMPACT_FORMS: &[(&str, &str)] = &[
    ("i", "Call-ID"),
    ("f", "From"),
    ("t", "To"),
    ("v", "Via"),
    ("m", "Contact"),
    ("l", "Content-Length"),
    ("c", "Content-Type"),
    ("o", "Event"),
    ("u", "Allow-Events"),
    ("k", "Supported"),
    ("e", "Content-Encoding"),
    ("s", "Subject"),
];

/// Case-insensitive header name comparison that also accepts compact forms
pub fn name_matches(candidate: &str, name: &str) -> bool {
    let candidate = candidate.trim();
    if candidate.eq_ignore_ascii_case(name) {
        return true;
    }
    COMPACT_FORMS.iter().any(|(short, long)| {
        (candidate.eq_ignore_ascii_case(short) && name.eq_ignore_ascii_case(long))
            || (candidate.eq_ignore_ascii_case(long) && name.eq_ignore_ascii_case(short))
    })
}

fn split(header: &Header) -> Option<(String, String)> {
    let line = header.to_string();
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// First value of the named header
pub fn find(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| match split(h) {
        Some((n, v)) if name_matches(&n, name) => Some(v),
        _ => None,
    })
}

/// Every value of the named header, in order
pub fn find_all(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| match split(h) {
            Some((n, v)) if name_matches(&n, name) => Some(v),
            _ => None,
        })
        .collect()
}

/// Copy of `headers` without any occurrence of `name`
pub fn without(headers: &Headers, name: &str) -> Headers {
    let kept: Vec<Header> = headers
        .iter()
        .filter(|h| !matches!(split(h), Some((n, _)) if name_matches(&n, name)))
        .cloned()
        .collect();
    Headers::from(kept)
}

/// Copy of `headers` with `name` set to exactly one `value`
///
/// The replacement takes the position of the first occurrence, or goes
/// before Content-Length when the header was absent.
pub fn replace(headers: &Headers, name: &str, value: String) -> Headers {
    let mut result: Vec<Header> = Vec::new();
    let mut inserted = false;

    for h in headers.iter() {
        match split(h) {
            Some((n, _)) if name_matches(&n, name) => {
                if !inserted {
                    result.push(Header::Other(name.to_string(), value.clone()));
                    inserted = true;
                }
            }
            Some((n, _)) if !inserted && name_matches(&n, "Content-Length") => {
                result.push(Header::Other(name.to_string(), value.clone()));
                inserted = true;
                result.push(h.clone());
            }
            _ => result.push(h.clone()),
        }
    }

    if !inserted {
        result.push(Header::Other(name.to_string(), value));
    }

    Headers::from(result)
}

/// Value of a `;name=value` parameter (case-insensitive name)
pub fn param(value: &str, name: &str) -> Option<String> {
    // Parameters after a bracketed URI belong to the header, not the URI
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };

    params.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=').unwrap_or((p, ""));
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Set or replace a parameter on a header value
pub fn with_param(value: &str, name: &str, param_value: &str) -> String {
    let (head, params) = match value.rfind('>') {
        Some(pos) => value.split_at(pos + 1),
        None => match value.find(';') {
            Some(pos) => value.split_at(pos),
            None => (value, ""),
        },
    };

    let mut result = head.to_string();
    let mut replaced = false;
    for p in params.split(';').filter(|p| !p.trim().is_empty()) {
        let key = p.split_once('=').map(|(k, _)| k).unwrap_or(p).trim();
        if key.eq_ignore_ascii_case(name) {
            result.push_str(&format!(";{}={}", name, param_value));
            replaced = true;
        } else {
            result.push(';');
            result.push_str(p.trim());
        }
    }
    if !replaced {
        result.push_str(&format!(";{}={}", name, param_value));
    }
    result
}

/// URI inside a name-addr (`"Bob" <sip:bob@host>;tag=x`) or a bare addr-spec
pub fn uri_of(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(open), Some(close)) if open < close => value[open + 1..close].trim().to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// Header value with any `;tag=` parameter stripped
pub fn without_tag(value: &str) -> String {
    let (head, params) = match value.rfind('>') {
        Some(pos) => value.split_at(pos + 1),
        None => match value.find(';') {
            Some(pos) => value.split_at(pos),
            None => (value, ""),
        },
    };
    let mut result = head.trim().to_string();
    for p in params.split(';').filter(|p| !p.trim().is_empty()) {
        let key = p.split_once('=').map(|(k, _)| k).unwrap_or(p).trim();
        if !key.eq_ignore_ascii_case("tag") {
            result.push(';');
            result.push_str(p.trim());
        }
    }
    result
}

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: String,
}

impl CSeq {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_ascii_uppercase();
        Some(Self { seq, method })
    }
}

/// Event header (RFC 3265 Section 7.2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub package: String,
    pub id: Option<String>,
}

impl EventHeader {
    pub fn parse(value: &str) -> Option<Self> {
        let package = value.split(';').next()?.trim();
        if package.is_empty() {
            return None;
        }
        Some(Self {
            package: package.to_ascii_lowercase(),
            id: param(value, "id").filter(|id| !id.is_empty()),
        })
    }

    pub fn render(package: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{};id={}", package, id),
            None => package.to_string(),
        }
    }
}

/// Subscription-State value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStateValue {
    Active,
    Pending,
    Terminated,
    Other,
}

/// Subscription-State header (RFC 3265 Section 7.2.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateHeader {
    pub state: SubscriptionStateValue,
    pub reason: Option<String>,
    pub expires: Option<u32>,
}

impl SubscriptionStateHeader {
    pub fn parse(value: &str) -> Option<Self> {
        let state = value.split(';').next()?.trim().to_ascii_lowercase();
        if state.is_empty() {
            return None;
        }
        let state = match state.as_str() {
            "active" => SubscriptionStateValue::Active,
            "pending" => SubscriptionStateValue::Pending,
            "terminated" => SubscriptionStateValue::Terminated,
            _ => SubscriptionStateValue::Other,
        };
        Some(Self {
            state,
            reason: param(value, "reason"),
            expires: param(value, "expires").and_then(|e| e.parse().ok()),
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SubscriptionStateValue::Terminated
    }
}

/// `type/sub-type` of a Content-Type value, lowercased, parameters dropped
pub fn media_sub_type(content_type: &str) -> Option<String> {
    let media = content_type.split(';').next()?.trim();
    let (_, sub_type) = media.split_once('/')?;
    Some(sub_type.trim().to_ascii_lowercase())
}

/// Ordered extra headers handed to the message factory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag {
    entries: Vec<(String, String)>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Set `name`, replacing an earlier value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| name_matches(n, name)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| name_matches(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}
