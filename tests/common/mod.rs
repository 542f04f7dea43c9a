//! In-memory IMAP server standing in for the network in integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use mailsweep::config::{
    AccountConfig, EncryptionConfig, IngestConfig, MailboxActionConfig,
};
use mailsweep::connector::{ConnectError, Dialer};
use mailsweep::message::{Address, BodyPart, Envelope, RawMessage, DELETED_FLAG};
use mailsweep::session::{
    FlagOp, IdKind, MailSession, MailboxInfo, SearchCriteria, SelectedMailbox, SessionError,
};
use mailsweep::vault;

pub const KEY: &str = "0123456789abcdef";
pub const IV: &str = "fedcba9876543210";

pub fn encryption() -> EncryptionConfig {
    EncryptionConfig {
        secret: KEY.to_string(),
        iv: IV.to_string(),
    }
}

pub fn ingest_config() -> IngestConfig {
    IngestConfig {
        folder_delay_secs: 0,
        fetch_batch_size: 2,
        channel_capacity: 1,
        ..IngestConfig::default()
    }
}

pub fn account(host: &str, user: &str, ingest: &[&str], prune: &[&str]) -> AccountConfig {
    AccountConfig {
        host: host.to_string(),
        port: 993,
        user: vault::encrypt(user, KEY, IV).unwrap(),
        password: vault::encrypt("hunter2", KEY, IV).unwrap(),
        ingest: MailboxActionConfig {
            folders: ingest.iter().map(|s| s.to_string()).collect(),
            threshold_days: 0,
        },
        prune: MailboxActionConfig {
            folders: prune.iter().map(|s| s.to_string()).collect(),
            threshold_days: 0,
        },
    }
}

pub fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
}

/// Builder for the messages a test folder holds.
pub struct MessageBuilder {
    raw: RawMessage,
}

pub fn message(id: &str, subject: &str) -> MessageBuilder {
    MessageBuilder {
        raw: RawMessage {
            flags: Vec::new(),
            envelope: Some(Envelope {
                date: Some("Tue, 5 Mar 2024 09:00:00 +0000".to_string()),
                subject: Some(subject.to_string()),
                from: vec![Address::new(Some("Shop"), "orders", "shop.example")],
                to: vec![Address::new(None, "me", "example.com")],
                message_id: Some(format!("<{}@test>", id)),
                ..Envelope::default()
            }),
            size: Some(1024),
            internal_date: Some(date(2024, 3, 5)),
            body_structure: Some(BodyPart::leaf("text", "plain")),
            ..RawMessage::default()
        },
    }
}

impl MessageBuilder {
    pub fn flag(mut self, flag: &str) -> Self {
        self.raw.flags.push(flag.to_string());
        self
    }

    pub fn from(mut self, mailbox: &str, host: &str) -> Self {
        if let Some(envelope) = self.raw.envelope.as_mut() {
            envelope.from = vec![Address::new(None, mailbox, host)];
        }
        self
    }

    pub fn attachment(mut self, filename: &str) -> Self {
        self.raw.body_structure = Some(BodyPart::multipart(
            "mixed",
            vec![
                BodyPart::leaf("text", "plain"),
                BodyPart::leaf("application", "pdf").with_disposition("attachment", Some(filename)),
            ],
        ));
        self
    }

    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.raw.internal_date = Some(at);
        self
    }

    pub fn without_message_id(mut self) -> Self {
        if let Some(envelope) = self.raw.envelope.as_mut() {
            envelope.message_id = None;
        }
        self
    }

    pub fn build(self) -> RawMessage {
        self.raw
    }
}

#[derive(Default)]
struct Mailbox {
    user: String,
    password: String,
    folders: BTreeMap<String, Vec<RawMessage>>,
    next_uid: u32,
}

#[derive(Default)]
struct ServerState {
    hosts: BTreeMap<String, Mailbox>,
    logins: usize,
    logouts: usize,
    moves: Vec<(String, Vec<u32>, String)>,
    noops: usize,
    /// (host, folder) pairs whose next SELECT finds the connection gone.
    drop_on_select: BTreeSet<(String, String)>,
}

/// A shared fake server. Clones see the same state.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: &str, user: &str, folders: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let mailbox = state.hosts.entry(host.to_string()).or_default();
        mailbox.user = user.to_string();
        mailbox.password = "hunter2".to_string();
        mailbox.next_uid = 1;
        for folder in folders {
            mailbox.folders.entry(folder.to_string()).or_default();
        }
    }

    /// Append a message, assigning it the next UID.
    pub fn deliver(&self, host: &str, folder: &str, mut raw: RawMessage) -> u32 {
        let mut state = self.state.lock().unwrap();
        let mailbox = state.hosts.get_mut(host).expect("unknown host");
        let uid = mailbox.next_uid;
        mailbox.next_uid += 1;
        raw.uid = Some(uid);
        mailbox
            .folders
            .get_mut(folder)
            .expect("unknown folder")
            .push(raw);
        uid
    }

    pub fn subjects(&self, host: &str, folder: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.hosts[host].folders[folder]
            .iter()
            .map(|m| {
                m.envelope
                    .as_ref()
                    .and_then(|e| e.subject.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn count(&self, host: &str, folder: &str) -> usize {
        self.state.lock().unwrap().hosts[host].folders[folder].len()
    }

    pub fn logins(&self) -> usize {
        self.state.lock().unwrap().logins
    }

    pub fn logouts(&self) -> usize {
        self.state.lock().unwrap().logouts
    }

    pub fn moves(&self) -> Vec<(String, Vec<u32>, String)> {
        self.state.lock().unwrap().moves.clone()
    }

    pub fn noops(&self) -> usize {
        self.state.lock().unwrap().noops
    }

    /// The next SELECT of `folder` on `host` finds the server has dropped the session.
    pub fn drop_connection_on_select(&self, host: &str, folder: &str) {
        self.state
            .lock()
            .unwrap()
            .drop_on_select
            .insert((host.to_string(), folder.to_string()));
    }

    pub fn dialer(&self) -> FakeDialer {
        FakeDialer {
            server: self.clone(),
        }
    }
}

pub struct FakeDialer {
    server: FakeServer,
}

impl Dialer for FakeDialer {
    fn dial(
        &self,
        host: &str,
        _port: u16,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn MailSession>, ConnectError> {
        let mut state = self.server.state.lock().unwrap();
        let Some(mailbox) = state.hosts.get(host) else {
            return Err(ConnectError::Connect {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        };
        if mailbox.user != username || mailbox.password != password {
            return Err(ConnectError::Auth {
                host: host.to_string(),
                reason: "LOGIN failed".to_string(),
            });
        }
        state.logins += 1;
        Ok(Box::new(FakeSession {
            server: self.server.clone(),
            host: host.to_string(),
            selected: None,
            read_only: true,
            logged_out: false,
        }))
    }
}

pub struct FakeSession {
    server: FakeServer,
    host: String,
    selected: Option<String>,
    read_only: bool,
    logged_out: bool,
}

impl FakeSession {
    fn with_folder<T>(
        &self,
        command: &'static str,
        f: impl FnOnce(&mut Mailbox, &str) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        if self.logged_out {
            return Err(SessionError::Stale(format!("{}: not authenticated", command)));
        }
        let folder = self
            .selected
            .clone()
            .ok_or_else(|| SessionError::command(command, "no folder selected"))?;
        let mut state = self.server.state.lock().unwrap();
        let mailbox = state.hosts.get_mut(&self.host).expect("unknown host");
        f(mailbox, &folder)
    }
}

fn matches(raw: &RawMessage, criteria: &SearchCriteria) -> bool {
    if let Some(before) = criteria.before {
        match raw.internal_date {
            Some(at) if at.date_naive() < before => {}
            _ => return false,
        }
    }
    if let Some(since) = criteria.since {
        match raw.internal_date {
            Some(at) if at.date_naive() >= since => {}
            _ => return false,
        }
    }
    if let Some(pattern) = &criteria.from {
        let pattern = pattern.to_lowercase();
        let from_matches = raw
            .envelope
            .as_ref()
            .map(|e| e.from.iter().any(|a| a.address().to_lowercase().contains(&pattern)))
            .unwrap_or(false);
        if !from_matches {
            return false;
        }
    }
    criteria.with_flags.iter().all(|f| raw.has_flag(f))
        && criteria.without_flags.iter().all(|f| !raw.has_flag(f))
}

impl MailSession for FakeSession {
    fn list(&mut self) -> Result<Vec<MailboxInfo>, SessionError> {
        let state = self.server.state.lock().unwrap();
        Ok(state.hosts[&self.host]
            .folders
            .keys()
            .map(|name| MailboxInfo::named(name))
            .collect())
    }

    fn select(&mut self, folder: &str, read_only: bool) -> Result<SelectedMailbox, SessionError> {
        if self.logged_out {
            return Err(SessionError::Stale("SELECT: not authenticated".to_string()));
        }
        let mut state = self.server.state.lock().unwrap();
        if state
            .drop_on_select
            .remove(&(self.host.clone(), folder.to_string()))
        {
            self.logged_out = true;
            return Err(SessionError::Stale("SELECT: connection lost".to_string()));
        }
        let Some(messages) = state.hosts[&self.host].folders.get(folder) else {
            return Err(SessionError::Select {
                folder: folder.to_string(),
                reason: "NO Mailbox does not exist".to_string(),
            });
        };
        let exists = messages.len() as u32;
        drop(state);
        self.selected = Some(folder.to_string());
        self.read_only = read_only;
        Ok(SelectedMailbox {
            name: folder.to_string(),
            exists,
            read_only,
        })
    }

    fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, SessionError> {
        self.with_folder("SEARCH", |mailbox, folder| {
            Ok(mailbox.folders[folder]
                .iter()
                .enumerate()
                .filter(|(_, m)| matches(m, criteria))
                .map(|(i, _)| i as u32 + 1)
                .collect())
        })
    }

    fn fetch(&mut self, seqs: &[u32]) -> Result<Vec<RawMessage>, SessionError> {
        self.with_folder("FETCH", |mailbox, folder| {
            let messages = &mailbox.folders[folder];
            Ok(seqs
                .iter()
                .filter_map(|&seq| {
                    messages.get(seq as usize - 1).map(|m| RawMessage {
                        seq,
                        ..m.clone()
                    })
                })
                .collect())
        })
    }

    fn store(&mut self, seqs: &[u32], op: FlagOp, flags: &[&str]) -> Result<(), SessionError> {
        let read_only = self.read_only;
        self.with_folder("STORE", |mailbox, folder| {
            if read_only {
                return Err(SessionError::command("STORE", "mailbox is read-only"));
            }
            let messages = mailbox.folders.get_mut(folder).expect("selected folder");
            for &seq in seqs {
                let Some(message) = messages.get_mut(seq as usize - 1) else {
                    continue;
                };
                for flag in flags {
                    match op {
                        FlagOp::Add if !message.has_flag(flag) => message.flags.push(flag.to_string()),
                        FlagOp::Remove => message.flags.retain(|f| !f.eq_ignore_ascii_case(flag)),
                        _ => {}
                    }
                }
            }
            Ok(())
        })
    }

    fn move_messages(&mut self, ids: &[u32], kind: IdKind, dest: &str) -> Result<(), SessionError> {
        let read_only = self.read_only;
        let result = self.with_folder("MOVE", |mailbox, folder| {
            if read_only {
                return Err(SessionError::command("MOVE", "mailbox is read-only"));
            }
            if !mailbox.folders.contains_key(dest) {
                return Err(SessionError::command("MOVE", "[TRYCREATE] no such destination"));
            }
            let source = mailbox.folders.get_mut(folder).expect("selected folder");
            let mut moved = Vec::new();
            let mut kept = Vec::new();
            for (i, message) in source.drain(..).enumerate() {
                let selected = match kind {
                    IdKind::Seq => ids.contains(&(i as u32 + 1)),
                    IdKind::Uid => message.uid.map(|u| ids.contains(&u)).unwrap_or(false),
                };
                if selected {
                    moved.push(message);
                } else {
                    kept.push(message);
                }
            }
            *source = kept;
            for mut message in moved {
                message.uid = Some(mailbox.next_uid);
                mailbox.next_uid += 1;
                mailbox.folders.get_mut(dest).expect("destination").push(message);
            }
            Ok(folder.to_string())
        })?;
        self.server
            .state
            .lock()
            .unwrap()
            .moves
            .push((result, ids.to_vec(), dest.to_string()));
        Ok(())
    }

    fn expunge(&mut self) -> Result<usize, SessionError> {
        self.with_folder("EXPUNGE", |mailbox, folder| {
            let messages = mailbox.folders.get_mut(folder).expect("selected folder");
            let before = messages.len();
            messages.retain(|m| !m.has_flag(DELETED_FLAG));
            Ok(before - messages.len())
        })
    }

    fn noop(&mut self) -> Result<(), SessionError> {
        if self.logged_out {
            return Err(SessionError::Stale("NOOP: not authenticated".to_string()));
        }
        self.server.state.lock().unwrap().noops += 1;
        Ok(())
    }

    fn logout(&mut self) -> Result<(), SessionError> {
        if self.logged_out {
            return Err(SessionError::Stale("LOGOUT: not authenticated".to_string()));
        }
        self.logged_out = true;
        self.server.state.lock().unwrap().logouts += 1;
        Ok(())
    }
}
