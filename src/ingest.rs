//! Ingest cycles: every configured account and folder is fetched, classified and
//! upserted into the message store.

use std::thread;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::classify;
use crate::config::{AccountConfig, IngestConfig};
use crate::connector::{Connection, ConnectError, Connector};
use crate::database::RecordSink;
use crate::fetch::{CancelToken, FetchError};
use crate::session::{SearchCriteria, SessionError};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSummary {
    pub folder: String,
    pub found: usize,
    pub stored: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSummary {
    pub account: String,
    pub folders: Vec<FolderSummary>,
    /// Set when the account could not be connected, or lost its connection for good.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accounts: Vec<AccountSummary>,
    pub cancelled: bool,
}

impl IngestSummary {
    pub fn stored(&self) -> usize {
        self.folders().map(|f| f.stored).sum()
    }

    pub fn skipped(&self) -> usize {
        self.folders().map(|f| f.skipped).sum()
    }

    pub fn failed_accounts(&self) -> usize {
        self.accounts.iter().filter(|a| a.error.is_some()).count()
    }

    fn folders(&self) -> impl Iterator<Item = &FolderSummary> {
        self.accounts.iter().flat_map(|a| a.folders.iter())
    }
}

pub struct Ingestor<'a> {
    connector: &'a Connector<'a>,
    sink: &'a dyn RecordSink,
    config: &'a IngestConfig,
    cancel: CancelToken,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        connector: &'a Connector<'a>,
        sink: &'a dyn RecordSink,
        config: &'a IngestConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            connector,
            sink,
            config,
            cancel,
        }
    }

    /// Run one cycle, then keep repeating every `repeat` until cancelled.
    pub fn run(&self, accounts: &[AccountConfig], repeat: Option<Duration>) -> Vec<IngestSummary> {
        let mut cycles = Vec::new();
        loop {
            let summary = self.run_cycle(accounts);
            let cancelled = summary.cancelled;
            cycles.push(summary);

            let Some(interval) = repeat else { break };
            if cancelled || !self.cancel.sleep(interval) {
                break;
            }
            log::info!("Starting ingest cycle {}", cycles.len() + 1);
        }
        cycles
    }

    /// One pass over every account with fresh connections.
    pub fn run_cycle(&self, accounts: &[AccountConfig]) -> IngestSummary {
        let today = Utc::now().date_naive();
        let accounts = if self.config.parallel_accounts && accounts.len() > 1 {
            thread::scope(|scope| {
                let workers: Vec<_> = accounts
                    .iter()
                    .map(|account| scope.spawn(move || self.ingest_account(account, today)))
                    .collect();
                workers
                    .into_iter()
                    .zip(accounts)
                    .map(|(worker, account)| {
                        worker.join().unwrap_or_else(|_| AccountSummary {
                            account: account.label().to_string(),
                            folders: Vec::new(),
                            error: Some("ingest worker panicked".to_string()),
                        })
                    })
                    .collect()
            })
        } else {
            accounts
                .iter()
                .map(|account| self.ingest_account(account, today))
                .collect()
        };

        let summary = IngestSummary {
            accounts,
            cancelled: self.cancel.is_cancelled(),
        };
        log::info!(
            "Ingest cycle finished: {} stored, {} skipped, {} of {} accounts failed",
            summary.stored(),
            summary.skipped(),
            summary.failed_accounts(),
            summary.accounts.len()
        );
        summary
    }

    pub fn ingest_account(&self, account: &AccountConfig, today: NaiveDate) -> AccountSummary {
        let label = account.label();
        let mut summary = AccountSummary {
            account: label.to_string(),
            ..AccountSummary::default()
        };

        let mut connection = match self.connector.connect(account) {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("account={} ingest skipped: {}", label, e);
                summary.error = Some(e.to_string());
                return summary;
            }
        };

        let criteria = SearchCriteria::older_than(account.ingest.threshold_days, today);
        for (i, folder) in account.ingest.folders.iter().enumerate() {
            if i > 0 && !self.cancel.sleep(self.config.folder_delay()) {
                break;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            connection = match self.connector.refresh(connection) {
                Ok(connection) => connection,
                Err(e) => {
                    log::error!("account={} reconnect failed, abandoning account: {}", label, e);
                    summary.error = Some(e.to_string());
                    return summary;
                }
            };

            let folder_summary = match self.ingest_folder(&mut connection, folder, &criteria) {
                Ok(folder_summary) => folder_summary,
                Err((partial, e)) => {
                    log::error!("account={} folder={} ingest failed: {}", label, folder, e);
                    FolderSummary {
                        error: Some(e.to_string()),
                        ..partial
                    }
                }
            };
            summary.folders.push(folder_summary);
        }

        if let Err(e) = connection.close() {
            log::warn!("account={} logout failed: {}", label, e);
        }
        summary
    }

    /// Examine `folder`, stream every candidate and upsert what classifies.
    /// On error the counts gathered so far are returned alongside it.
    pub fn ingest_folder(
        &self,
        connection: &mut Connection,
        folder: &str,
        criteria: &SearchCriteria,
    ) -> Result<FolderSummary, (FolderSummary, IngestError)> {
        let label = connection.label().to_string();
        let mut summary = FolderSummary {
            folder: folder.to_string(),
            ..FolderSummary::default()
        };

        let mut mailbox = match connection.select(folder, true) {
            Ok(mailbox) => mailbox,
            Err(e) => return Err((summary, e.into())),
        };
        let seqs = match mailbox.search(criteria) {
            Ok(seqs) => seqs,
            Err(e) => return Err((summary, e.into())),
        };
        summary.found = seqs.len();
        log::info!(
            "account={} folder={} found {} messages to ingest",
            label,
            folder,
            seqs.len()
        );

        let (mut stored, mut skipped) = (0, 0);
        let sink = self.sink;
        let result = mailbox.fetch(&seqs, &self.cancel, |raw| {
            let record = match classify::to_record(&raw, folder) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("account={} folder={} skipping message: {}", label, folder, e);
                    skipped += 1;
                    return;
                }
            };
            match sink.upsert(&record) {
                Ok(_) => {
                    stored += 1;
                    if stored % 100 == 0 {
                        log::info!("account={} folder={} stored {} messages", label, folder, stored);
                    }
                }
                Err(e) => {
                    log::error!(
                        "account={} folder={} message_id={} not stored: {}",
                        label,
                        folder,
                        record.message_id,
                        e
                    );
                    skipped += 1;
                }
            }
        });

        summary.stored = stored;
        summary.skipped = skipped;
        log::info!(
            "account={} folder={} processed {} of {} messages ({} skipped)",
            label,
            folder,
            stored + skipped,
            summary.found,
            skipped
        );

        match result {
            Ok(_) => Ok(summary),
            Err(e) => Err((summary, e.into())),
        }
    }
}
