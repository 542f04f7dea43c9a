use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use mailsweep::config::Config;
use mailsweep::connector::Connector;
use mailsweep::database::MessageStore;
use mailsweep::fetch::CancelToken;
use mailsweep::imap_client::TlsDialer;
use mailsweep::ingest::Ingestor;
use mailsweep::triage::{bulk_delete, BulkDeleteMode, Pruner};
use mailsweep::vault::Vault;

/// Ingest, classify and triage IMAP mailboxes
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value_t = Config::default_path())]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Cancel the run after this many seconds
    #[clap(long)]
    timeout: Option<u64>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a username and password for the config file
    AuthInit,

    /// Log into every account and check its configured folders exist
    AuthValidate,

    /// Ingest message metadata into the local database
    Ingest {
        /// Re-run the ingest every N seconds until cancelled
        #[clap(long)]
        repeat: Option<u64>,
    },

    /// Move flagged, attachment and receipt messages into archive folders
    Prune,

    /// Move or purge every message from a sender
    BulkDelete {
        /// Sender address or fragment to match against the From header
        #[clap(long)]
        from: String,

        /// Folder to search
        #[clap(long, default_value = "INBOX")]
        folder: String,

        /// Expunge matches instead of moving them to the review folder
        #[clap(long)]
        purge: bool,
    },

    /// Print per-folder statistics from the local database
    Report,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .parse_default_env()
        .init();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every account succeeded.
fn run(args: Args) -> Result<bool> {
    match args.command {
        Commands::AuthInit => {
            let config = Config::read(&args.config)
                .with_context(|| format!("Failed to read config {}", args.config))?;
            auth_init(&config).map(|_| true)
        }
        Commands::AuthValidate => Ok(validate_accounts(&load(&args.config)?)),
        Commands::Ingest { repeat } => {
            ingest(&load(&args.config)?, cancel_token(args.timeout), repeat)
        }
        Commands::Prune => Ok(prune(&load(&args.config)?, cancel_token(args.timeout))),
        Commands::BulkDelete { from, folder, purge } => {
            Ok(purge_sender(&load(&args.config)?, &from, &folder, purge))
        }
        Commands::Report => report(&load(&args.config)?),
    }
}

fn load(path: &str) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load config {}", path))
}

fn cancel_token(timeout: Option<u64>) -> CancelToken {
    let cancel = CancelToken::new();
    if let Some(secs) = timeout {
        cancel.cancel_after(Duration::from_secs(secs));
    }
    cancel
}

fn open_store(config: &Config) -> Result<MessageStore> {
    let db_path = config.database.resolved_path();
    MessageStore::open(&db_path)
        .with_context(|| format!("Failed to initialize database {:?}", db_path))
}

fn validate_accounts(config: &Config) -> bool {
    let vault = Vault::new(&config.encryption);
    let dialer = TlsDialer;
    let connector = Connector::new(&vault, &dialer, &config.ingest);

    let (connections, failures) = connector.connect_all(&config.accounts);
    for connection in connections {
        info!(
            "account={} ok, folders: {:?}",
            connection.label(),
            connection.folder_names()
        );
        if let Err(e) = connection.close() {
            warn!("logout failed: {}", e);
        }
    }
    for (account, e) in &failures {
        error!("account={} failed validation: {}", account, e);
    }
    failures.is_empty()
}

fn ingest(config: &Config, cancel: CancelToken, repeat: Option<u64>) -> Result<bool> {
    let vault = Vault::new(&config.encryption);
    let dialer = TlsDialer;
    let connector = Connector::new(&vault, &dialer, &config.ingest);
    let store = open_store(config)?;

    let ingestor = Ingestor::new(&connector, &store, &config.ingest, cancel);
    let cycles = ingestor.run(&config.accounts, repeat.map(Duration::from_secs));
    let ok = cycles.last().map(|c| c.failed_accounts() == 0).unwrap_or(true);
    info!(
        "Ingest finished after {} cycle(s); {} messages in database",
        cycles.len(),
        store.count()?
    );
    Ok(ok)
}

fn prune(config: &Config, cancel: CancelToken) -> bool {
    let vault = Vault::new(&config.encryption);
    let dialer = TlsDialer;
    let connector = Connector::new(&vault, &dialer, &config.ingest);
    let pruner = Pruner::new(&config.triage, cancel.clone());

    let mut ok = true;
    for account in &config.accounts {
        if cancel.is_cancelled() {
            warn!("Prune cancelled before account={}", account.label());
            return false;
        }
        let summary = pruner.prune_account(&connector, account);
        for report in &summary.folders {
            info!(
                "account={} folder={} {}: {} candidates, {} moved, {} skipped",
                report.account,
                report.folder,
                report.state,
                report.candidates,
                report.moved(),
                report.skipped
            );
            for bucket in report.buckets.iter().filter(|b| b.error.is_some()) {
                warn!(
                    "account={} folder={} {} bucket not moved to {}",
                    report.account, report.folder, bucket.name, bucket.destination
                );
            }
        }
        ok &= summary.succeeded();
    }
    ok
}

fn purge_sender(config: &Config, from: &str, folder: &str, purge: bool) -> bool {
    let vault = Vault::new(&config.encryption);
    let dialer = TlsDialer;
    let connector = Connector::new(&vault, &dialer, &config.ingest);
    let mode = if purge {
        BulkDeleteMode::Purge
    } else {
        BulkDeleteMode::MoveTo(config.triage.review_folder.clone())
    };

    let mut ok = true;
    for account in &config.accounts {
        let mut connection = match connector.connect(account) {
            Ok(connection) => connection,
            Err(e) => {
                error!("account={} skipped: {}", account.label(), e);
                ok = false;
                continue;
            }
        };
        if !connection.has_folder(folder) {
            warn!("account={} has no folder {}, skipping", connection.label(), folder);
            continue;
        }
        match bulk_delete(&mut connection, folder, from, &mode) {
            Ok(report) => info!(
                "account={} folder={} {} matched, moved to {:?}, {} expunged",
                connection.label(),
                report.folder,
                report.matched,
                report.moved_to,
                report.expunged
            ),
            Err(e) => {
                error!("account={} bulk delete failed: {}", connection.label(), e);
                ok = false;
            }
        }
        if let Err(e) = connection.close() {
            warn!("account={} logout failed: {}", account.label(), e);
        }
    }
    ok
}

fn report(config: &Config) -> Result<bool> {
    let store = open_store(config)?;
    println!(
        "{:<40} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "folder", "total", "unseen", "flagged", "receipt", "attach"
    );
    for stats in store.folder_stats()? {
        println!(
            "{:<40} {:>8} {:>8} {:>8} {:>8} {:>8}",
            stats.folder,
            stats.total,
            stats.unseen,
            stats.flagged,
            stats.receipts,
            stats.with_attachments
        );
    }
    Ok(true)
}

fn auth_init(config: &Config) -> Result<()> {
    let vault = Vault::new(&config.encryption);
    info!(
        "Found configured encryption secret and iv (secret_len={}, iv_len={})",
        config.encryption.secret.len(),
        config.encryption.iv.len()
    );

    let username = rpassword::prompt_password("Enter Username: ").context("Failed to read username")?;
    let password = rpassword::prompt_password("Enter Password: ").context("Failed to read password")?;
    let (username, password) = (username.trim(), password.trim_end_matches(['\r', '\n']));
    if username.is_empty() || password.is_empty() {
        bail!("Username and password must not be empty");
    }

    println!("Encrypted username: {}", vault.encrypt(username)?);
    println!("Encrypted password: {}", vault.encrypt(password)?);
    info!("Add the encrypted credentials above to the account's user and password fields");
    Ok(())
}
