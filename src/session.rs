//! The mail session seam and the selected-folder wrapper built on top of it.

use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::fetch::{self, CancelToken, FetchError, FetchOptions, FetchSummary};
use crate::message::RawMessage;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is no longer authenticated, reconnect required: {0}")]
    Stale(String),

    #[error("Failed to select folder {folder}: {reason}")]
    Select { folder: String, reason: String },

    #[error("IMAP {command} failed: {reason}")]
    Command { command: &'static str, reason: String },
}

impl SessionError {
    pub fn command(command: &'static str, reason: impl ToString) -> Self {
        SessionError::Command {
            command,
            reason: reason.to_string(),
        }
    }

    /// True when the underlying connection must be re-created rather than the folder re-selected.
    pub fn is_stale(&self) -> bool {
        matches!(self, SessionError::Stale(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub delimiter: Option<String>,
    pub attributes: Vec<String>,
}

impl MailboxInfo {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delimiter: Some("/".to_string()),
            attributes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedMailbox {
    pub name: String,
    pub exists: u32,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Remove,
}

impl FlagOp {
    pub fn store_item(&self) -> &'static str {
        match self {
            FlagOp::Add => "+FLAGS.SILENT",
            FlagOp::Remove => "-FLAGS.SILENT",
        }
    }
}

/// Whether a set of message numbers holds sequence numbers or UIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Seq,
    Uid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub before: Option<NaiveDate>,
    pub since: Option<NaiveDate>,
    pub from: Option<String>,
    pub with_flags: Vec<String>,
    pub without_flags: Vec<String>,
}

impl SearchCriteria {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn before(date: NaiveDate) -> Self {
        Self {
            before: Some(date),
            ..Self::default()
        }
    }

    /// `ALL`, or `BEFORE today-threshold_days` when the threshold is positive.
    pub fn older_than(threshold_days: u32, today: NaiveDate) -> Self {
        if threshold_days == 0 {
            return Self::all();
        }
        match today.checked_sub_days(Days::new(u64::from(threshold_days))) {
            Some(cutoff) => Self::before(cutoff),
            None => Self::all(),
        }
    }

    pub fn from_sender(pattern: &str) -> Self {
        Self {
            from: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Render as an IMAP SEARCH key list. Empty criteria match everything.
    pub fn to_query(&self) -> String {
        let mut keys = Vec::new();
        if let Some(date) = self.before {
            keys.push(format!("BEFORE {}", imap_date(date)));
        }
        if let Some(date) = self.since {
            keys.push(format!("SINCE {}", imap_date(date)));
        }
        if let Some(from) = &self.from {
            keys.push(format!("FROM {}", quote(from)));
        }
        for flag in &self.with_flags {
            keys.push(flag_key(flag, true));
        }
        for flag in &self.without_flags {
            keys.push(flag_key(flag, false));
        }
        if keys.is_empty() {
            "ALL".to_string()
        } else {
            keys.join(" ")
        }
    }
}

fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn flag_key(flag: &str, present: bool) -> String {
    let system = match flag.to_ascii_lowercase().as_str() {
        "\\seen" => Some(("SEEN", "UNSEEN")),
        "\\flagged" => Some(("FLAGGED", "UNFLAGGED")),
        "\\deleted" => Some(("DELETED", "UNDELETED")),
        "\\answered" => Some(("ANSWERED", "UNANSWERED")),
        "\\draft" => Some(("DRAFT", "UNDRAFT")),
        _ => None,
    };
    match (system, present) {
        (Some((yes, _)), true) => yes.to_string(),
        (Some((_, no)), false) => no.to_string(),
        (None, true) => format!("KEYWORD {}", flag),
        (None, false) => format!("UNKEYWORD {}", flag),
    }
}

/// Compact IMAP sequence set, e.g. `1:3,7,9:10`.
pub fn format_sequence_set(ids: &[u32]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for id in iter {
        if id == end + 1 {
            end = id;
            continue;
        }
        parts.push(range(start, end));
        start = id;
        end = id;
    }
    parts.push(range(start, end));
    parts.join(",")
}

fn range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

/// A live, authenticated, single-client mail session.
///
/// Implementations are stateful: `select` changes what every later call operates on.
/// A session is `Send` so a fetch producer thread can drive it, but it is never shared.
pub trait MailSession: Send {
    fn list(&mut self) -> Result<Vec<MailboxInfo>, SessionError>;

    fn select(&mut self, folder: &str, read_only: bool) -> Result<SelectedMailbox, SessionError>;

    /// Sequence numbers of matching messages in the selected folder.
    fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, SessionError>;

    /// Envelope, flags, size, UID, internal date, body structure and header of each message.
    fn fetch(&mut self, seqs: &[u32]) -> Result<Vec<RawMessage>, SessionError>;

    fn store(&mut self, seqs: &[u32], op: FlagOp, flags: &[&str]) -> Result<(), SessionError>;

    fn move_messages(&mut self, ids: &[u32], kind: IdKind, dest: &str) -> Result<(), SessionError>;

    /// Permanently remove `\Deleted` messages, returning how many went.
    fn expunge(&mut self) -> Result<usize, SessionError>;

    fn noop(&mut self) -> Result<(), SessionError>;

    fn logout(&mut self) -> Result<(), SessionError>;
}

/// A folder selected on a connection. Borrowing the session mutably keeps anyone
/// else from re-selecting underneath it.
pub struct MailboxSession<'a> {
    session: &'a mut dyn MailSession,
    label: &'a str,
    mailbox: SelectedMailbox,
    options: FetchOptions,
}

impl<'a> MailboxSession<'a> {
    pub fn open(
        session: &'a mut dyn MailSession,
        label: &'a str,
        folder: &str,
        read_only: bool,
        options: FetchOptions,
    ) -> Result<Self, SessionError> {
        let mailbox = session.select(folder, read_only)?;
        log::info!(
            "account={} folder={} selected ({} messages, read_only={})",
            label,
            mailbox.name,
            mailbox.exists,
            mailbox.read_only
        );
        Ok(Self {
            session,
            label,
            mailbox,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.mailbox.name
    }

    pub fn exists(&self) -> u32 {
        self.mailbox.exists
    }

    pub fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, SessionError> {
        let mut seqs = self.session.search(criteria)?;
        seqs.sort_unstable();
        log::info!(
            "account={} folder={} search '{}' matched {} messages",
            self.label,
            self.mailbox.name,
            criteria.to_query(),
            seqs.len()
        );
        Ok(seqs)
    }

    /// Stream the given messages through `consumer`. See [`fetch::stream_messages`].
    pub fn fetch<F>(
        &mut self,
        seqs: &[u32],
        cancel: &CancelToken,
        consumer: F,
    ) -> Result<FetchSummary, FetchError>
    where
        F: FnMut(RawMessage),
    {
        fetch::stream_messages(&mut *self.session, seqs, &self.options, cancel, consumer)
    }

    pub fn move_messages(&mut self, seqs: &[u32], dest: &str) -> Result<(), SessionError> {
        self.move_ids(seqs, IdKind::Seq, dest)
    }

    pub fn move_uids(&mut self, uids: &[u32], dest: &str) -> Result<(), SessionError> {
        self.move_ids(uids, IdKind::Uid, dest)
    }

    fn move_ids(&mut self, ids: &[u32], kind: IdKind, dest: &str) -> Result<(), SessionError> {
        if ids.is_empty() {
            return Ok(());
        }
        log::info!(
            "account={} folder={} moving {} messages to {}",
            self.label,
            self.mailbox.name,
            ids.len(),
            dest
        );
        self.session.move_messages(ids, kind, dest)
    }

    pub fn store_flags(&mut self, seqs: &[u32], op: FlagOp, flags: &[&str]) -> Result<(), SessionError> {
        if seqs.is_empty() {
            return Ok(());
        }
        log::debug!(
            "account={} folder={} {} {:?} on {} messages",
            self.label,
            self.mailbox.name,
            op.store_item(),
            flags,
            seqs.len()
        );
        self.session.store(seqs, op, flags)
    }

    pub fn expunge(&mut self) -> Result<usize, SessionError> {
        let removed = self.session.expunge()?;
        log::info!(
            "account={} folder={} expunged {} messages",
            self.label,
            self.mailbox.name,
            removed
        );
        Ok(removed)
    }
}
