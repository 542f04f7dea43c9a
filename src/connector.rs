//! Per-account connection setup: decrypt, dial, login, list and validate folders.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{AccountConfig, FolderPurpose, IngestConfig};
use crate::fetch::FetchOptions;
use crate::session::{MailSession, MailboxInfo, MailboxSession, SessionError};
use crate::vault::{Vault, VaultError};

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Unable to decrypt credentials: {0}")]
    Decryption(#[from] VaultError),

    #[error("Unable to connect to mail server {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Unable to login to host {host}: {reason}")]
    Auth { host: String, reason: String },

    #[error("Unable to list folders: {0}")]
    List(#[source] SessionError),

    #[error("Folder {folder} does not exist for account {account} to {purpose}")]
    FolderValidation {
        account: String,
        folder: String,
        purpose: FolderPurpose,
    },
}

/// Opens authenticated sessions. Production code uses [`crate::imap_client::TlsDialer`].
pub trait Dialer: Sync {
    fn dial(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn MailSession>, ConnectError>;
}

/// Every folder named in the account config must exist on the server.
pub fn validate_folders(account: &AccountConfig, mailboxes: &[MailboxInfo]) -> Result<(), ConnectError> {
    for (folder, purpose) in account.configured_folders() {
        if !mailboxes.iter().any(|m| m.name == folder) {
            return Err(ConnectError::FolderValidation {
                account: account.label().to_string(),
                folder: folder.to_string(),
                purpose,
            });
        }
    }
    Ok(())
}

/// An authenticated session plus the folder list discovered when it was opened.
///
/// The session is logged out when the connection is closed or dropped, on every path.
pub struct Connection {
    session: Box<dyn MailSession>,
    mailboxes: Vec<MailboxInfo>,
    account: AccountConfig,
    created_at: Instant,
    options: FetchOptions,
    closed: bool,
}

impl Connection {
    pub fn label(&self) -> &str {
        self.account.label()
    }

    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    pub fn mailboxes(&self) -> &[MailboxInfo] {
        &self.mailboxes
    }

    pub fn folder_names(&self) -> Vec<&str> {
        self.mailboxes.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn has_folder(&self, folder: &str) -> bool {
        self.mailboxes.iter().any(|m| m.name == folder)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Sends NOOP; false when the server no longer answers on this session.
    pub fn is_live(&mut self) -> bool {
        match self.session.noop() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("account={} NOOP liveness check failed: {}", self.label(), e);
                false
            }
        }
    }

    pub fn select(&mut self, folder: &str, read_only: bool) -> Result<MailboxSession<'_>, SessionError> {
        if !self.has_folder(folder) {
            return Err(SessionError::Select {
                folder: folder.to_string(),
                reason: "folder not in the discovered folder list".to_string(),
            });
        }
        MailboxSession::open(
            &mut *self.session,
            self.account.label(),
            folder,
            read_only,
            self.options,
        )
    }

    pub fn close(mut self) -> Result<(), SessionError> {
        self.closed = true;
        let result = self.session.logout();
        log::info!("account={} logged out", self.label());
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.session.logout() {
            log::error!("account={} failed logout: {}", self.label(), e);
        } else {
            log::debug!("account={} logged out on drop", self.label());
        }
    }
}

pub struct Connector<'a> {
    vault: &'a Vault,
    dialer: &'a dyn Dialer,
    options: FetchOptions,
    max_age: Duration,
}

impl<'a> Connector<'a> {
    pub fn new(vault: &'a Vault, dialer: &'a dyn Dialer, ingest: &IngestConfig) -> Self {
        Self {
            vault,
            dialer,
            options: FetchOptions::from(ingest),
            max_age: ingest.max_connection_age(),
        }
    }

    pub fn connect(&self, account: &AccountConfig) -> Result<Connection, ConnectError> {
        let label = account.label();
        let username = self.vault.decrypt(&account.user)?;
        let password = self.vault.decrypt(&account.password)?;
        log::info!(
            "account={} decrypted imap credentials (user_len={}, pwd_len={})",
            label,
            username.len(),
            password.len()
        );

        let session = self.dialer.dial(&account.host, account.port, &username, &password)?;
        log::info!("account={} logged into {}:{}", label, account.host, account.port);

        let mut connection = Connection {
            session,
            mailboxes: Vec::new(),
            account: account.clone(),
            created_at: Instant::now(),
            options: self.options,
            closed: false,
        };

        connection.mailboxes = connection.session.list().map_err(ConnectError::List)?;
        log::info!(
            "account={} listed folders: {:?}",
            label,
            connection.folder_names()
        );

        validate_folders(account, &connection.mailboxes)?;
        Ok(connection)
    }

    /// Connect every account. Failures are logged and returned alongside the successes.
    pub fn connect_all(&self, accounts: &[AccountConfig]) -> (Vec<Connection>, Vec<(String, ConnectError)>) {
        let mut connections = Vec::new();
        let mut failures = Vec::new();
        for account in accounts {
            match self.connect(account) {
                Ok(connection) => connections.push(connection),
                Err(e) => {
                    log::error!("account={} skipped: {}", account.label(), e);
                    failures.push((account.label().to_string(), e));
                }
            }
        }
        (connections, failures)
    }

    /// Keep `connection` if it is young enough and answers NOOP, otherwise replace it.
    pub fn refresh(&self, mut connection: Connection) -> Result<Connection, ConnectError> {
        if connection.age() < self.max_age && connection.is_live() {
            return Ok(connection);
        }
        let account = connection.account.clone();
        log::info!(
            "account={} reconnecting (age {:?})",
            account.label(),
            connection.age()
        );
        if let Err(e) = connection.close() {
            log::debug!("account={} logout of stale session failed: {}", account.label(), e);
        }
        self.connect(&account)
    }
}
