use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SEEN_FLAG: &str = "\\Seen";
pub const FLAGGED_FLAG: &str = "\\Flagged";
pub const IMPORTANT_FLAG: &str = "\\Important";
pub const DELETED_FLAG: &str = "\\Deleted";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl Address {
    pub fn new(name: Option<&str>, mailbox: &str, host: &str) -> Self {
        Self {
            name: name.map(|n| n.to_string()),
            mailbox: Some(mailbox.to_string()),
            host: Some(host.to_string()),
        }
    }

    pub fn unknown() -> Self {
        Self::new(None, "unknown", "unknown")
    }

    /// `mailbox@host`, or whichever half is present.
    pub fn address(&self) -> String {
        let mailbox = self.mailbox.as_deref().unwrap_or_default();
        match self.host.as_deref() {
            Some(host) if !host.is_empty() => format!("{}@{}", mailbox, host),
            _ => mailbox.to_string(),
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub message_id: Option<String>,
}

/// One node of a BODYSTRUCTURE tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPart {
    pub mime_type: String,
    pub mime_subtype: String,
    pub disposition: Option<String>,
    pub disposition_params: Vec<(String, String)>,
    pub type_params: Vec<(String, String)>,
    pub children: Vec<BodyPart>,
}

impl BodyPart {
    pub fn leaf(mime_type: &str, mime_subtype: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            mime_subtype: mime_subtype.to_string(),
            ..Default::default()
        }
    }

    pub fn multipart(subtype: &str, children: Vec<BodyPart>) -> Self {
        Self {
            mime_type: "multipart".to_string(),
            mime_subtype: subtype.to_string(),
            children,
            ..Default::default()
        }
    }

    pub fn with_disposition(mut self, disposition: &str, filename: Option<&str>) -> Self {
        self.disposition = Some(disposition.to_string());
        if let Some(name) = filename {
            self.disposition_params
                .push(("filename".to_string(), name.to_string()));
        }
        self
    }

    /// Disposition `filename`, falling back to the content-type `name` parameter.
    pub fn filename(&self) -> Option<&str> {
        fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        }
        param(&self.disposition_params, "filename").or_else(|| param(&self.type_params, "name"))
    }

    pub fn mime(&self) -> String {
        format!("{}/{}", self.mime_type, self.mime_subtype).to_lowercase()
    }

    /// Depth-first, pre-order walk. `visit` receives the part path (1-based like IMAP section numbers).
    pub fn walk<F>(&self, visit: &mut F)
    where
        F: FnMut(&[usize], &BodyPart),
    {
        let mut path = Vec::new();
        self.walk_inner(&mut path, visit);
    }

    fn walk_inner<F>(&self, path: &mut Vec<usize>, visit: &mut F)
    where
        F: FnMut(&[usize], &BodyPart),
    {
        visit(path, self);
        for (i, child) in self.children.iter().enumerate() {
            path.push(i + 1);
            child.walk_inner(path, visit);
            path.pop();
        }
    }
}

/// A message as it comes off the wire, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub seq: u32,
    pub uid: Option<u32>,
    pub flags: Vec<String>,
    pub envelope: Option<Envelope>,
    pub size: Option<u32>,
    pub internal_date: Option<DateTime<Utc>>,
    pub body_structure: Option<BodyPart>,
    pub header: Option<Vec<u8>>,
}

impl RawMessage {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    pub fn message_id(&self) -> Option<&str> {
        self.envelope.as_ref().and_then(|e| e.message_id.as_deref())
    }
}

/// The persisted form of a classified message. `message_id` is the only stable key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub seq_num: u32,
    pub uid: u32,
    pub from: String,
    pub from_name: String,
    pub to: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub size_bytes: u32,
    pub folder: String,
    pub is_seen: bool,
    pub is_flagged: bool,
    pub is_receipt: bool,
    pub has_attachment: bool,
    pub attachment_names: String,
    pub attributes: String,
}
