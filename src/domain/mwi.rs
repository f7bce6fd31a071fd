//! Message Waiting Indication - RFC 3842 message-summary bodies

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageSummaryError {
    #[error("Missing Messages-Waiting line")]
    MissingStatus,

    #[error("Invalid line '{0}'")]
    InvalidLine(String),
}

/// Counts for one message class (voice, fax, ...)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub new: u32,
    pub old: u32,
    pub urgent_new: u32,
    pub urgent_old: u32,
}

impl MessageCounts {
    /// Parse `new/old` or `new/old (urgent_new/urgent_old)`
    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (plain, urgent) = match value.split_once('(') {
            Some((plain, urgent)) => (plain.trim(), Some(urgent.trim_end_matches(')').trim())),
            None => (value, None),
        };

        let pair = |s: &str| -> Option<(u32, u32)> {
            let (a, b) = s.split_once('/')?;
            Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
        };

        let (new, old) = pair(plain)?;
        let (urgent_new, urgent_old) = match urgent {
            Some(u) => pair(u)?,
            None => (0, 0),
        };

        Some(Self {
            new,
            old,
            urgent_new,
            urgent_old,
        })
    }
}

/// Parsed message-summary document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub messages_waiting: bool,
    pub message_account: Option<String>,
    pub voice: Option<MessageCounts>,
    pub fax: Option<MessageCounts>,
}

impl MessageSummary {
    /// Parse a `application/simple-message-summary` body
    pub fn parse(body: &str) -> Result<Self, MessageSummaryError> {
        let mut summary = MessageSummary::default();
        let mut seen_status = false;

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                // Optional message headers follow the first blank line
                if seen_status {
                    break;
                }
                continue;
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| MessageSummaryError::InvalidLine(line.to_string()))?;
            let value = value.trim();

            match name.trim().to_ascii_lowercase().as_str() {
                "messages-waiting" => {
                    summary.messages_waiting = match value.to_ascii_lowercase().as_str() {
                        "yes" => true,
                        "no" => false,
                        _ => return Err(MessageSummaryError::InvalidLine(line.to_string())),
                    };
                    seen_status = true;
                }
                "message-account" => summary.message_account = Some(value.to_string()),
                "voice-message" => {
                    summary.voice = Some(
                        MessageCounts::parse(value)
                            .ok_or_else(|| MessageSummaryError::InvalidLine(line.to_string()))?,
                    )
                }
                "fax-message" => {
                    summary.fax = Some(
                        MessageCounts::parse(value)
                            .ok_or_else(|| MessageSummaryError::InvalidLine(line.to_string()))?,
                    )
                }
                // Other message classes are accepted and ignored
                _ => {}
            }
        }

        if !seen_status {
            return Err(MessageSummaryError::MissingStatus);
        }

        Ok(summary)
    }

    pub fn total_new(&self) -> u32 {
        [self.voice, self.fax]
            .iter()
            .flatten()
            .map(|c| c.new + c.urgent_new)
            .sum()
    }

    /// Generate RFC 3842 message-summary body
    pub fn to_body(&self) -> String {
        let mut body = String::new();

        let waiting = if self.messages_waiting { "yes" } else { "no" };
        body.push_str(&format!("Messages-Waiting: {}\r\n", waiting));

        if let Some(account) = &self.message_account {
            body.push_str(&format!("Message-Account: {}\r\n", account));
        }

        for (name, counts) in [("Voice-Message", self.voice), ("Fax-Message", self.fax)] {
            if let Some(c) = counts {
                body.push_str(&format!(
                    "{}: {}/{} ({}/{})\r\n",
                    name, c.new, c.old, c.urgent_new, c.urgent_old
                ));
            }
        }

        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_summary() {
        let body = "Messages-Waiting: yes\r\n\
                    Message-Account: sip:alice@vmail.example.com\r\n\
                    Voice-Message: 2/8 (0/2)\r\n";

        let summary = MessageSummary::parse(body).unwrap();
        assert!(summary.messages_waiting);
        assert_eq!(
            summary.message_account.as_deref(),
            Some("sip:alice@vmail.example.com")
        );
        assert_eq!(
            summary.voice,
            Some(MessageCounts {
                new: 2,
                old: 8,
                urgent_new: 0,
                urgent_old: 2
            })
        );
        assert_eq!(summary.total_new(), 2);
    }

    #[test]
    fn test_parse_without_urgent_counts() {
        let summary = MessageSummary::parse("Messages-Waiting: no\r\nVoice-Message: 0/3\r\n").unwrap();
        assert!(!summary.messages_waiting);
        assert_eq!(summary.voice.unwrap().old, 3);
        assert_eq!(summary.voice.unwrap().urgent_old, 0);
    }

    #[test]
    fn test_parse_rejects_missing_status() {
        assert_eq!(
            MessageSummary::parse("Voice-Message: 1/0\r\n"),
            Err(MessageSummaryError::MissingStatus)
        );
    }

    #[test]
    fn test_body_round_trip() {
        let summary = MessageSummary {
            messages_waiting: true,
            message_account: None,
            voice: Some(MessageCounts {
                new: 1,
                old: 4,
                urgent_new: 1,
                urgent_old: 0,
            }),
            fax: None,
        };

        assert_eq!(MessageSummary::parse(&summary.to_body()).unwrap(), summary);
    }
}
