pub mod classify;
pub mod config;
pub mod connector;
pub mod database;
pub mod fetch;
pub mod imap_client;
pub mod ingest;
pub mod message;
pub mod session;
pub mod triage;
pub mod vault;

// Re-export commonly used types
pub use config::{AccountConfig, Config, ConfigError};
pub use connector::{Connection, Connector, Dialer};
pub use database::{MessageStore, RecordSink};
pub use fetch::CancelToken;
pub use imap_client::TlsDialer;
pub use ingest::Ingestor;
pub use message::{MessageRecord, RawMessage};
pub use session::{MailSession, MailboxSession, SearchCriteria};
pub use triage::{bulk_delete, AccountPruneReport, BulkDeleteMode, Pruner};
pub use vault::Vault;
