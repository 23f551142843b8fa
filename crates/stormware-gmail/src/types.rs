//! Gmail resource model: labels, addresses, messages and search queries.

use std::fmt;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, Utc};
use lettre::message::Mailboxes;
use serde::{Deserialize, Serialize};

use stormware_gcp::{GcpError, GcpResult};

/// Gmail encodes bodies and attachments as base64url, padded or not.
pub(crate) const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub(crate) fn decode_base64_url(data: &str) -> GcpResult<Vec<u8>> {
    BASE64_URL
        .decode(data.trim())
        .map_err(|e| GcpError::parse("gmail", e))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Label {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub email: String,
    pub display_name: Option<String>,
}

impl Address {
    /// Parse a header value holding one or more addresses.
    ///
    /// Values lettre cannot parse are kept verbatim, one per comma.
    pub fn parse_list(value: &str) -> Vec<Address> {
        match value.parse::<Mailboxes>() {
            Ok(mailboxes) => mailboxes
                .into_iter()
                .map(|mailbox| Address {
                    email: mailbox.email.to_string(),
                    display_name: mailbox.name.filter(|n| !n.is_empty()),
                })
                .collect(),
            Err(_) => value
                .split(',')
                .map(str::trim)
                .filter(|raw| !raw.is_empty())
                .map(|raw| Address {
                    email: raw.to_string(),
                    display_name: None,
                })
                .collect(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display_name {
            Some(ref name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

// ── Raw API payload ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

/// A MIME part of a message as returned with `format=full`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub part_id: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    fn decoded_text(&self) -> GcpResult<String> {
        let data = self.body.data.as_deref().ok_or_else(|| {
            GcpError::parse("gmail", format!("part {:?} has no body data", self.part_id))
        })?;
        String::from_utf8(decode_base64_url(data)?).map_err(|e| GcpError::parse("gmail", e))
    }
}

// ── Message ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize)]
pub struct Message {
    pub id: String,
    pub thread_id: Option<String>,
    pub sender: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub subject: Option<String>,
    pub plain_text: Option<String>,
    pub html_text: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub labels: Vec<Label>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Take the text bodies out of a part, descending into alternatives.
    pub fn add_part(&mut self, part: &MessagePart) -> GcpResult<()> {
        match part.mime_type.as_deref() {
            Some("text/plain") => self.plain_text = Some(part.decoded_text()?),
            Some("text/html") => self.html_text = Some(part.decoded_text()?),
            Some("multipart/alternative") => {
                for sub in &part.parts {
                    self.add_part(sub)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// ── Query ───────────────────────────────────────────────────────────────

/// A Gmail search query.
///
/// Renders to the search box syntax, e.g.
/// `invoice from:billing@example.com after:1704067200 has:attachment`.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    pub sender: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    pub timestamp_from: Option<DateTime<Utc>>,
    pub timestamp_to: Option<DateTime<Utc>>,
    pub label: Option<String>,
    /// Sent as `labelIds`, not as part of the query string.
    pub labels: Vec<Label>,
    pub attachment: bool,
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut terms: Vec<String> = Vec::new();
        if !self.text.is_empty() {
            terms.push(self.text.clone());
        }
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        if let Some(sender) = non_empty(&self.sender) {
            terms.push(format!("from:{}", sender));
        }
        if let Some(to) = non_empty(&self.to) {
            terms.push(format!("to:{}", to));
        }
        if let Some(cc) = non_empty(&self.cc) {
            terms.push(format!("cc:{}", cc));
        }
        if let Some(subject) = non_empty(&self.subject) {
            terms.push(format!("subject:({})", subject));
        }
        if let Some(from) = self.timestamp_from {
            terms.push(format!("after:{}", from.timestamp()));
        }
        if let Some(to) = self.timestamp_to {
            terms.push(format!("before:{}", to.timestamp()));
        }
        if let Some(label) = non_empty(&self.label) {
            terms.push(format!("label:({})", label));
        }
        if self.attachment {
            terms.push("has:attachment".to_string());
        }
        write!(f, "{}", terms.join(" "))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn text_part(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.into()),
            body: PartBody {
                data: Some(BASE64_URL.encode(text)),
                attachment_id: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn query_rendering() {
        assert_eq!(Query::default().to_string(), "");
        let query = Query {
            text: "invoice".into(),
            sender: Some("billing@example.com".into()),
            to: Some("me@example.com".into()),
            cc: Some(String::new()),
            subject: Some("March report".into()),
            timestamp_from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            timestamp_to: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            label: Some("finance".into()),
            labels: vec![Label::new("INBOX")],
            attachment: true,
        };
        assert_eq!(
            query.to_string(),
            "invoice from:billing@example.com to:me@example.com subject:(March report) \
             after:1704067200 before:1706745600 label:(finance) has:attachment"
        );
    }

    #[test]
    fn add_part_decodes_bodies() {
        let mut message = Message::new("m1");
        message.add_part(&text_part("text/plain", "Hello 👋")).unwrap();
        let alternative = MessagePart {
            mime_type: Some("multipart/alternative".into()),
            parts: vec![text_part("text/html", "<p>Hello</p>")],
            ..Default::default()
        };
        message.add_part(&alternative).unwrap();
        message.add_part(&text_part("image/png", "ignored")).unwrap();

        assert_eq!(message.plain_text.as_deref(), Some("Hello 👋"));
        assert_eq!(message.html_text.as_deref(), Some("<p>Hello</p>"));
    }

    #[test]
    fn base64_url_accepts_missing_padding() {
        assert_eq!(decode_base64_url("aGk").unwrap(), b"hi");
        assert_eq!(decode_base64_url("aGk=").unwrap(), b"hi");
        assert_eq!(decode_base64_url("-_8").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn address_lists() {
        let addresses = Address::parse_list("Jane Doe <jane@example.com>, bob@example.com");
        assert_eq!(
            addresses,
            vec![
                Address {
                    email: "jane@example.com".into(),
                    display_name: Some("Jane Doe".into()),
                },
                Address {
                    email: "bob@example.com".into(),
                    display_name: None,
                },
            ]
        );
        assert_eq!(addresses[0].to_string(), "Jane Doe <jane@example.com>");
    }

    #[test]
    fn unparseable_addresses_are_kept() {
        let addresses = Address::parse_list("undisclosed-recipients:;");
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].email, "undisclosed-recipients:;");
    }
}
