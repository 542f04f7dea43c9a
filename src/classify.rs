//! Rule based classification of fetched messages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use unicode_general_category::{get_general_category, GeneralCategory};

use crate::config::Disposition;
use crate::message::{
    Address, BodyPart, Envelope, MessageRecord, RawMessage, FLAGGED_FLAG, IMPORTANT_FLAG,
    SEEN_FLAG,
};

/// Subject words that mark a message as a receipt. Matched as whole words, case-insensitively.
pub const RECEIPT_KEYWORDS: [&str; 9] = [
    "refund",
    "shipped",
    "receipt",
    "confirmation",
    "order",
    "confirm",
    "boarding",
    "delivered",
    "reservation",
];

/// Header fields copied into a record's attribute blob.
const ATTRIBUTE_HEADERS: [&str; 6] = [
    "list-id",
    "list-unsubscribe",
    "return-path",
    "x-mailer",
    "precedence",
    "auto-submitted",
];

const ATTACHMENT_SEPARATOR: &str = "#";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("message seq={seq} has no envelope")]
    MissingEnvelope { seq: u32 },

    #[error("message seq={seq} has no Message-ID")]
    MissingMessageId { seq: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub sender: Address,
    pub subject: String,
    pub is_seen: bool,
    pub is_flagged: bool,
    pub is_receipt: bool,
    pub attachments: Vec<String>,
}

impl Classification {
    pub fn has_attachment(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn attachment_names(&self) -> String {
        self.attachments.join(ATTACHMENT_SEPARATOR)
    }

    pub fn matches(&self, disposition: Disposition) -> bool {
        match disposition {
            Disposition::Flagged => self.is_flagged,
            Disposition::Attachment => self.has_attachment(),
            Disposition::Receipt => self.is_receipt,
        }
    }

    /// First disposition in `priority` this message matches.
    pub fn disposition(&self, priority: &[Disposition]) -> Option<Disposition> {
        priority.iter().copied().find(|d| self.matches(*d))
    }
}

pub fn classify(raw: &RawMessage) -> Result<Classification, ClassifyError> {
    let envelope = raw
        .envelope
        .as_ref()
        .ok_or(ClassifyError::MissingEnvelope { seq: raw.seq })?;

    let raw_subject = envelope.subject.as_deref().unwrap_or_default();
    let subject = sanitize_subject(&decode_encoded_words(raw_subject));

    let attachments = raw
        .body_structure
        .as_ref()
        .map(|body| attachment_names(body, raw.message_id().unwrap_or("?")))
        .unwrap_or_default();

    Ok(Classification {
        sender: resolve_sender(envelope),
        is_receipt: is_receipt(&subject),
        subject,
        is_seen: raw.has_flag(SEEN_FLAG),
        is_flagged: raw.has_flag(FLAGGED_FLAG) || raw.has_flag(IMPORTANT_FLAG),
        attachments,
    })
}

/// Classify and build the record persisted for `raw`, which must carry a Message-ID.
pub fn to_record(raw: &RawMessage, folder: &str) -> Result<MessageRecord, ClassifyError> {
    let classification = classify(raw)?;
    let envelope = raw
        .envelope
        .as_ref()
        .ok_or(ClassifyError::MissingEnvelope { seq: raw.seq })?;
    let message_id = envelope
        .message_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(ClassifyError::MissingMessageId { seq: raw.seq })?;

    let received_at = envelope
        .date
        .as_deref()
        .and_then(parse_envelope_date)
        .or(raw.internal_date)
        .unwrap_or_default();

    Ok(MessageRecord {
        message_id: message_id.to_string(),
        seq_num: raw.seq,
        uid: raw.uid.unwrap_or_default(),
        from: classification.sender.address(),
        from_name: decode_encoded_words(&classification.sender.display_name()),
        to: envelope.to.first().map(Address::address).unwrap_or_default(),
        subject: classification.subject.clone(),
        received_at,
        size_bytes: raw.size.unwrap_or_default(),
        folder: folder.to_string(),
        is_seen: classification.is_seen,
        is_flagged: classification.is_flagged,
        is_receipt: classification.is_receipt,
        has_attachment: classification.has_attachment(),
        attachment_names: classification.attachment_names(),
        attributes: attributes_json(raw),
    })
}

/// Reply-To, then Sender, then From; the first address of the first non-empty list wins.
pub fn resolve_sender(envelope: &Envelope) -> Address {
    let candidates = [
        ("reply-to", &envelope.reply_to),
        ("sender", &envelope.sender),
        ("from", &envelope.from),
    ];
    for (field, addresses) in candidates {
        let Some(first) = addresses.first() else {
            continue;
        };
        if addresses.len() > 1 {
            log::warn!(
                "message {}: ignoring {} extra {} addresses: {:?}",
                envelope.message_id.as_deref().unwrap_or("?"),
                addresses.len() - 1,
                field,
                addresses[1..].iter().map(Address::address).collect::<Vec<_>>()
            );
        }
        return first.clone();
    }

    log::error!(
        "message {} has no sender addresses",
        envelope.message_id.as_deref().unwrap_or("?")
    );
    Address::unknown()
}

/// Words are runs of alphanumerics, apostrophes, hyphens and underscores.
pub fn subject_words(subject: &str) -> impl Iterator<Item = &str> {
    subject
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '-' || c == '_'))
        .filter(|w| !w.is_empty())
}

pub fn is_receipt(subject: &str) -> bool {
    subject_words(subject).any(|word| {
        let word = word.to_lowercase();
        RECEIPT_KEYWORDS.contains(&word.as_str())
    })
}

/// Filenames of every part whose disposition is `attachment`, in tree order.
pub fn attachment_names(body: &BodyPart, message_id: &str) -> Vec<String> {
    let mut names = Vec::new();
    body.walk(&mut |path, part| {
        let is_attachment = part
            .disposition
            .as_deref()
            .map(|d| d.eq_ignore_ascii_case("attachment"))
            .unwrap_or(false);
        if !is_attachment {
            return;
        }
        let filename = part.filename().unwrap_or_default();
        log::debug!(
            "message {} part {:?} is an attachment: type={}, filename={}",
            message_id,
            path,
            part.mime(),
            filename
        );
        names.push(filename.to_string());
    });
    names
}

/// Keep letters, marks, numbers, punctuation, symbols and the ASCII space. Controls,
/// format characters, unassigned and private-use code points and every other
/// separator are dropped.
pub fn sanitize_subject(subject: &str) -> String {
    subject.chars().filter(|c| is_printable(*c)).collect()
}

fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    !matches!(
        get_general_category(c),
        GeneralCategory::Control
            | GeneralCategory::Format
            | GeneralCategory::Surrogate
            | GeneralCategory::PrivateUse
            | GeneralCategory::Unassigned
            | GeneralCategory::SpaceSeparator
            | GeneralCategory::LineSeparator
            | GeneralCategory::ParagraphSeparator
    )
}

/// Decode RFC 2047 encoded-words; text without them is returned unchanged.
pub fn decode_encoded_words(raw: &str) -> String {
    if !raw.contains("=?") {
        return raw.to_string();
    }
    let synthetic = format!("Subject: {}\r\n\r\n", raw);
    mail_parser::Message::parse(synthetic.as_bytes())
        .and_then(|parsed| parsed.subject().map(|s| s.to_string()))
        .unwrap_or_else(|| raw.to_string())
}

fn parse_envelope_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = match raw.find(" (") {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    DateTime::parse_from_rfc2822(trimmed.trim())
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

fn attributes_json(raw: &RawMessage) -> String {
    let mut attributes = BTreeMap::new();
    if let Some(date) = raw.internal_date {
        attributes.insert("internal_date".to_string(), date.to_rfc3339());
    }
    if let Some(header) = raw.header.as_deref() {
        attributes.extend(header_attributes(header));
    }
    serde_json::to_string(&attributes).unwrap_or_else(|_| "{}".to_string())
}

fn header_attributes(header: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(parsed) = mail_parser::Message::parse(header) else {
        return out;
    };
    for header in parsed.headers() {
        let name = header.name().to_string().to_lowercase();
        if !ATTRIBUTE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let value = match header.value() {
            mail_parser::HeaderValue::Text(t) => Some(t.to_string()),
            mail_parser::HeaderValue::TextList(list) => {
                Some(list.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "))
            }
            mail_parser::HeaderValue::Address(addr) => {
                addr.address.as_ref().map(|s| s.to_string())
            }
            mail_parser::HeaderValue::AddressList(list) => Some(
                list.iter()
                    .filter_map(|addr| addr.address.as_ref().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            mail_parser::HeaderValue::DateTime(dt) => Some(format!("{}", dt)),
            _ => None,
        };
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            out.insert(name, value);
        }
    }
    out
}
