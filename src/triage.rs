//! Prune and bulk-delete: classify the messages of a folder and move them into
//! per-disposition archive folders.

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::classify::{self, Classification};
use crate::config::{AccountConfig, TriageConfig};
use crate::connector::{Connection, Connector};
use crate::fetch::{CancelToken, FetchError};
use crate::message::{RawMessage, DELETED_FLAG};
use crate::session::{FlagOp, SearchCriteria, SessionError};

#[derive(Error, Debug)]
pub enum PruneError {
    #[error("Failed to select folder: {0}")]
    Select(#[source] SessionError),

    #[error("Search failed: {0}")]
    Search(#[source] SessionError),

    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("Move of {count} messages to {destination} failed: {source}")]
    Move {
        destination: String,
        count: usize,
        #[source]
        source: SessionError,
    },

    #[error("Failed to mark messages deleted: {0}")]
    Store(#[source] SessionError),

    #[error("Expunge failed: {0}")]
    Expunge(#[source] SessionError),

    #[error("Refusing to bulk delete with an empty sender pattern")]
    EmptyPattern,

    #[error("Prune cancelled")]
    Cancelled,
}

/// Progress of one folder through a prune. `Aborted` can follow any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneState {
    Connected,
    FolderSelected,
    MessagesFetched,
    Classified,
    Bucketed,
    Moved,
    Complete,
    Aborted,
}

impl std::fmt::Display for PruneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PruneState::Connected => "connected",
            PruneState::FolderSelected => "folder-selected",
            PruneState::MessagesFetched => "messages-fetched",
            PruneState::Classified => "classified",
            PruneState::Bucketed => "bucketed",
            PruneState::Moved => "moved",
            PruneState::Complete => "complete",
            PruneState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Messages bound for one destination folder, by UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
    pub destination: String,
    pub uids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOutcome {
    pub name: String,
    pub destination: String,
    pub requested: usize,
    pub moved: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub account: String,
    pub folder: String,
    pub state: PruneState,
    pub candidates: usize,
    pub classified: usize,
    pub skipped: usize,
    pub buckets: Vec<BucketOutcome>,
    pub error: Option<String>,
}

impl PruneReport {
    fn new(account: &str, folder: &str) -> Self {
        Self {
            account: account.to_string(),
            folder: folder.to_string(),
            state: PruneState::Connected,
            candidates: 0,
            classified: 0,
            skipped: 0,
            buckets: Vec::new(),
            error: None,
        }
    }

    pub fn moved(&self) -> usize {
        self.buckets.iter().map(|b| b.moved).sum()
    }

    /// Completed with every bucket moved.
    pub fn succeeded(&self) -> bool {
        self.state == PruneState::Complete && self.buckets.iter().all(|b| b.error.is_none())
    }

    fn abort(mut self, error: PruneError) -> Self {
        log::error!(
            "account={} folder={} prune aborted after {}: {}",
            self.account,
            self.folder,
            self.state,
            error
        );
        self.state = PruneState::Aborted;
        self.error = Some(error.to_string());
        self
    }

    fn advance(&mut self, state: PruneState) {
        log::debug!(
            "account={} folder={} prune {} -> {}",
            self.account,
            self.folder,
            self.state,
            state
        );
        self.state = state;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountPruneReport {
    pub account: String,
    pub folders: Vec<PruneReport>,
    /// Set when the account could not be connected, or reconnected between folders.
    pub error: Option<String>,
}

impl AccountPruneReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.folders.iter().all(PruneReport::succeeded)
    }
}

/// Assign every message to at most one bucket: the first disposition in `priority` it
/// matches, or the stale bucket when configured and nothing matched.
/// Buckets come back in priority order with the stale bucket last; empty ones are kept.
pub fn assign_buckets(messages: &[(u32, Classification)], triage: &TriageConfig) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = triage
        .priority
        .iter()
        .map(|d| Bucket {
            name: d.to_string(),
            destination: triage.destination(*d).to_string(),
            uids: Vec::new(),
        })
        .collect();
    let mut stale = triage.stale_folder.as_ref().map(|dest| Bucket {
        name: "stale".to_string(),
        destination: dest.clone(),
        uids: Vec::new(),
    });

    for (uid, classification) in messages {
        match classification.disposition(&triage.priority) {
            Some(disposition) => {
                if let Some(i) = triage.priority.iter().position(|d| *d == disposition) {
                    buckets[i].uids.push(*uid);
                }
            }
            None => {
                if let Some(stale) = stale.as_mut() {
                    stale.uids.push(*uid);
                }
            }
        }
    }

    buckets.extend(stale);
    buckets
}

pub struct Pruner<'a> {
    triage: &'a TriageConfig,
    cancel: CancelToken,
    today: NaiveDate,
}

impl<'a> Pruner<'a> {
    pub fn new(triage: &'a TriageConfig, cancel: CancelToken) -> Self {
        Self {
            triage,
            cancel,
            today: Utc::now().date_naive(),
        }
    }

    /// Pin the date the age threshold is measured from.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Connect `account` and prune every folder it lists under `prune`. Before each
    /// folder the session is checked with NOOP and replaced when stale or too old.
    pub fn prune_account(&self, connector: &Connector<'_>, account: &AccountConfig) -> AccountPruneReport {
        let label = account.label();
        let mut summary = AccountPruneReport {
            account: label.to_string(),
            ..AccountPruneReport::default()
        };

        let mut connection = match connector.connect(account) {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("account={} prune skipped: {}", label, e);
                summary.error = Some(e.to_string());
                return summary;
            }
        };

        for folder in &account.prune.folders {
            if self.cancel.is_cancelled() {
                break;
            }
            connection = match connector.refresh(connection) {
                Ok(connection) => connection,
                Err(e) => {
                    log::error!("account={} reconnect failed, abandoning account: {}", label, e);
                    summary.error = Some(e.to_string());
                    return summary;
                }
            };
            let report = self.prune_folder(&mut connection, folder, account.prune.threshold_days);
            summary.folders.push(report);
        }

        if let Err(e) = connection.close() {
            log::warn!("account={} logout failed: {}", label, e);
        }
        summary
    }

    pub fn prune_folder(&self, connection: &mut Connection, folder: &str, threshold_days: u32) -> PruneReport {
        let label = connection.label().to_string();
        let mut report = PruneReport::new(&label, folder);

        let mut mailbox = match connection.select(folder, false) {
            Ok(mailbox) => mailbox,
            Err(e) => return report.abort(PruneError::Select(e)),
        };
        report.advance(PruneState::FolderSelected);

        let criteria = SearchCriteria::older_than(threshold_days, self.today);
        let seqs = match mailbox.search(&criteria) {
            Ok(seqs) => seqs,
            Err(e) => return report.abort(PruneError::Search(e)),
        };
        report.candidates = seqs.len();

        let mut fetched: Vec<RawMessage> = Vec::with_capacity(seqs.len());
        if let Err(e) = mailbox.fetch(&seqs, &self.cancel, |raw| fetched.push(raw)) {
            return report.abort(e.into());
        }
        report.advance(PruneState::MessagesFetched);

        let mut classified = Vec::with_capacity(fetched.len());
        for raw in &fetched {
            let Some(uid) = raw.uid else {
                log::warn!("account={} folder={} seq={} has no UID, skipping", label, folder, raw.seq);
                report.skipped += 1;
                continue;
            };
            match classify::classify(raw) {
                Ok(classification) => classified.push((uid, classification)),
                Err(e) => {
                    log::warn!("account={} folder={} skipping message: {}", label, folder, e);
                    report.skipped += 1;
                }
            }
        }
        report.classified = classified.len();
        report.advance(PruneState::Classified);

        let buckets = assign_buckets(&classified, self.triage);
        report.advance(PruneState::Bucketed);

        for bucket in buckets {
            if self.cancel.is_cancelled() {
                return report.abort(PruneError::Cancelled);
            }
            if bucket.uids.is_empty() {
                log::info!(
                    "account={} folder={} no {} messages to move",
                    label,
                    folder,
                    bucket.name
                );
                continue;
            }
            if bucket.destination == folder {
                log::info!(
                    "account={} folder={} {} messages already in {}",
                    label,
                    folder,
                    bucket.name,
                    bucket.destination
                );
                continue;
            }

            let mut outcome = BucketOutcome {
                name: bucket.name.clone(),
                destination: bucket.destination.clone(),
                requested: bucket.uids.len(),
                moved: 0,
                error: None,
            };
            match mailbox.move_uids(&bucket.uids, &bucket.destination) {
                Ok(()) => {
                    outcome.moved = bucket.uids.len();
                    log::info!(
                        "account={} folder={} moved {} {} messages to {}",
                        label,
                        folder,
                        outcome.moved,
                        bucket.name,
                        bucket.destination
                    );
                    report.buckets.push(outcome);
                }
                Err(source) => {
                    let stale = source.is_stale();
                    let err = PruneError::Move {
                        destination: bucket.destination.clone(),
                        count: bucket.uids.len(),
                        source,
                    };
                    log::error!("account={} folder={} {}", label, folder, err);
                    outcome.error = Some(err.to_string());
                    report.buckets.push(outcome);
                    if stale {
                        return report.abort(err);
                    }
                }
            }
        }
        report.advance(PruneState::Moved);

        log::info!(
            "account={} folder={} prune complete: {} candidates, {} moved, {} skipped",
            label,
            folder,
            report.candidates,
            report.moved(),
            report.skipped
        );
        report.advance(PruneState::Complete);
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkDeleteMode {
    /// Move matches into a review folder.
    MoveTo(String),
    /// Mark matches `\Deleted` and expunge them.
    Purge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkDeleteReport {
    pub folder: String,
    pub matched: usize,
    pub moved_to: Option<String>,
    pub expunged: usize,
}

/// Move or purge every message in `folder` whose From header contains `pattern`.
pub fn bulk_delete(
    connection: &mut Connection,
    folder: &str,
    pattern: &str,
    mode: &BulkDeleteMode,
) -> Result<BulkDeleteReport, PruneError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(PruneError::EmptyPattern);
    }
    let label = connection.label().to_string();

    let mut mailbox = connection.select(folder, false).map_err(PruneError::Select)?;
    let seqs = mailbox
        .search(&SearchCriteria::from_sender(pattern))
        .map_err(PruneError::Search)?;

    let mut report = BulkDeleteReport {
        folder: folder.to_string(),
        matched: seqs.len(),
        moved_to: None,
        expunged: 0,
    };
    if seqs.is_empty() {
        log::info!("account={} folder={} no messages from '{}'", label, folder, pattern);
        return Ok(report);
    }

    match mode {
        BulkDeleteMode::MoveTo(destination) => {
            mailbox
                .move_messages(&seqs, destination)
                .map_err(|source| PruneError::Move {
                    destination: destination.clone(),
                    count: seqs.len(),
                    source,
                })?;
            report.moved_to = Some(destination.clone());
        }
        BulkDeleteMode::Purge => {
            mailbox
                .store_flags(&seqs, FlagOp::Add, &[DELETED_FLAG])
                .map_err(PruneError::Store)?;
            report.expunged = mailbox.expunge().map_err(PruneError::Expunge)?;
        }
    }

    log::info!(
        "account={} folder={} bulk delete of '{}': {} matched",
        label,
        folder,
        pattern,
        report.matched
    );
    Ok(report)
}
