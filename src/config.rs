use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("No mail accounts configured")]
    NoAccounts,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Key material shared by every account's stored credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub secret: String,
    pub iv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .map(|d| d.join("mailsweep").join("messages.db"))
            .unwrap_or_else(|| PathBuf::from("messages.db"));
        Self {
            path: path.to_string_lossy().into_owned(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxActionConfig {
    pub folders: Vec<String>,
    /// Only messages older than this many days are considered. Zero disables the filter.
    pub threshold_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    /// Encrypted username. Also used as the account label in logs.
    pub user: String,
    /// Encrypted password.
    pub password: String,
    #[serde(default)]
    pub ingest: MailboxActionConfig,
    #[serde(default)]
    pub prune: MailboxActionConfig,
}

fn default_imap_port() -> u16 {
    993
}

impl AccountConfig {
    pub fn label(&self) -> &str {
        &self.user
    }

    /// Every folder the account configuration refers to, ingest folders first.
    pub fn configured_folders(&self) -> impl Iterator<Item = (&str, FolderPurpose)> {
        self.ingest
            .folders
            .iter()
            .map(|f| (f.as_str(), FolderPurpose::Ingest))
            .chain(
                self.prune
                    .folders
                    .iter()
                    .map(|f| (f.as_str(), FolderPurpose::Prune)),
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderPurpose {
    Ingest,
    Prune,
}

impl std::fmt::Display for FolderPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FolderPurpose::Ingest => write!(f, "ingest"),
            FolderPurpose::Prune => write!(f, "prune"),
        }
    }
}

/// Triage categories, in the order used to break ties when a message matches several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Flagged,
    Attachment,
    Receipt,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Flagged => write!(f, "flagged"),
            Disposition::Attachment => write!(f, "has-attachment"),
            Disposition::Receipt => write!(f, "receipt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub flagged_folder: String,
    pub attachment_folder: String,
    pub receipt_folder: String,
    /// Destination for candidates matching no disposition. Left in place when unset.
    pub stale_folder: Option<String>,
    pub review_folder: String,
    pub priority: Vec<Disposition>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            flagged_folder: "Inbox/z-archive/flagged".to_string(),
            attachment_folder: "Inbox/z-archive/has-attachment".to_string(),
            receipt_folder: "Inbox/z-archive/receipt".to_string(),
            stale_folder: None,
            review_folder: "Inbox/z-archive/to-delete".to_string(),
            priority: vec![
                Disposition::Flagged,
                Disposition::Attachment,
                Disposition::Receipt,
            ],
        }
    }
}

impl TriageConfig {
    pub fn destination(&self, disposition: Disposition) -> &str {
        match disposition {
            Disposition::Flagged => &self.flagged_folder,
            Disposition::Attachment => &self.attachment_folder,
            Disposition::Receipt => &self.receipt_folder,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub folder_delay_secs: u64,
    pub fetch_batch_size: usize,
    pub channel_capacity: usize,
    pub parallel_accounts: bool,
    pub max_connection_age_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            folder_delay_secs: 2,
            fetch_batch_size: 50,
            channel_capacity: 10,
            parallel_accounts: false,
            max_connection_age_secs: 600,
        }
    }
}

impl IngestConfig {
    pub fn folder_delay(&self) -> Duration {
        Duration::from_secs(self.folder_delay_secs)
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Config {
    pub fn default_path() -> String {
        "~/.config/mailsweep/config.json".to_string()
    }

    /// Read and validate the configuration. Unlike account errors, any failure here is fatal.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating; `auth-init` only needs the encryption section.
    pub fn read(path: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(path).into_owned();
        let path = Path::new(&expanded);

        if !path.exists() {
            return Err(ConfigError::NotFound(expanded));
        }

        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }

        for (i, account) in self.accounts.iter().enumerate() {
            if account.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("account {} has no host", i)));
            }
            if account.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "account {} ({}) has port 0",
                    i,
                    account.label()
                )));
            }
        }

        if self.ingest.fetch_batch_size == 0 || self.ingest.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "fetch_batch_size and channel_capacity must be positive".to_string(),
            ));
        }

        let mut seen = Vec::new();
        for disposition in &self.triage.priority {
            if seen.contains(disposition) {
                return Err(ConfigError::Invalid(format!(
                    "disposition {} listed twice in triage priority",
                    disposition
                )));
            }
            seen.push(*disposition);
        }

        Ok(())
    }
}
