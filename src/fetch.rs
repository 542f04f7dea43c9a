//! Streaming fetch: a producer thread issues batched FETCH commands and hands each
//! message to the calling thread over a bounded channel.
//!
//! The consumer always drains the channel to completion before the producer is
//! joined, so a full buffer can never wedge the producer, and a producer error is
//! only reported once every message fetched before it has been consumed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::IngestConfig;
use crate::message::RawMessage;
use crate::session::{MailSession, SessionError};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Fetch failed after {delivered} messages: {source}")]
    Session {
        delivered: usize,
        #[source]
        source: SessionError,
    },

    #[error("Fetch cancelled after {delivered} messages")]
    Cancelled { delivered: usize },

    #[error("Fetch producer thread panicked")]
    ProducerPanicked,
}

/// Cooperative cancellation shared between a run and every fetch it starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns false if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    /// Cancel automatically once `timeout` elapses.
    pub fn cancel_after(&self, timeout: Duration) {
        let token = self.clone();
        thread::spawn(move || {
            if token.sleep(timeout) {
                log::warn!("Run timed out after {:?}, cancelling", timeout);
                token.cancel();
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub batch_size: usize,
    pub channel_capacity: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            channel_capacity: 10,
        }
    }
}

impl From<&IngestConfig> for FetchOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.fetch_batch_size,
            channel_capacity: config.channel_capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub requested: usize,
    pub delivered: usize,
}

/// Fetch `seqs` in batches and feed every message to `consumer`, in server order.
pub fn stream_messages<F>(
    session: &mut dyn MailSession,
    seqs: &[u32],
    options: &FetchOptions,
    cancel: &CancelToken,
    mut consumer: F,
) -> Result<FetchSummary, FetchError>
where
    F: FnMut(RawMessage),
{
    if seqs.is_empty() {
        return Ok(FetchSummary::default());
    }

    let batch_size = options.batch_size.max(1);
    let (tx, rx) = mpsc::sync_channel::<RawMessage>(options.channel_capacity.max(1));

    thread::scope(|scope| {
        let producer = scope.spawn(move || produce(session, seqs, batch_size, cancel, tx));

        let mut delivered = 0;
        for message in rx.iter() {
            consumer(message);
            delivered += 1;
        }

        match producer.join() {
            Ok(Ok(_)) => Ok(FetchSummary {
                requested: seqs.len(),
                delivered,
            }),
            Ok(Err(ProducerStop::Cancelled)) => Err(FetchError::Cancelled { delivered }),
            Ok(Err(ProducerStop::Session(source))) => Err(FetchError::Session { delivered, source }),
            Err(_) => Err(FetchError::ProducerPanicked),
        }
    })
}

enum ProducerStop {
    Cancelled,
    Session(SessionError),
}

fn produce(
    session: &mut dyn MailSession,
    seqs: &[u32],
    batch_size: usize,
    cancel: &CancelToken,
    tx: mpsc::SyncSender<RawMessage>,
) -> Result<usize, ProducerStop> {
    let mut sent = 0;
    for batch in seqs.chunks(batch_size) {
        if cancel.is_cancelled() {
            return Err(ProducerStop::Cancelled);
        }
        log::debug!("Fetching batch of {} messages ({} sent so far)", batch.len(), sent);
        let messages = session.fetch(batch).map_err(ProducerStop::Session)?;
        for message in messages {
            if cancel.is_cancelled() {
                return Err(ProducerStop::Cancelled);
            }
            if tx.send(message).is_err() {
                // consumer went away; nothing left to deliver to
                return Ok(sent);
            }
            sent += 1;
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FlagOp, IdKind, MailboxInfo, SearchCriteria, SelectedMailbox};

    /// Only `fetch` matters here; everything else is inert.
    struct NumberedSession {
        total: u32,
        fail_on_batch: Option<usize>,
        batches: usize,
    }

    impl MailSession for NumberedSession {
        fn list(&mut self) -> Result<Vec<MailboxInfo>, SessionError> {
            Ok(Vec::new())
        }
        fn select(&mut self, folder: &str, read_only: bool) -> Result<SelectedMailbox, SessionError> {
            Ok(SelectedMailbox {
                name: folder.to_string(),
                exists: self.total,
                read_only,
            })
        }
        fn search(&mut self, _: &SearchCriteria) -> Result<Vec<u32>, SessionError> {
            Ok((1..=self.total).collect())
        }
        fn fetch(&mut self, seqs: &[u32]) -> Result<Vec<RawMessage>, SessionError> {
            self.batches += 1;
            if self.fail_on_batch == Some(self.batches) {
                return Err(SessionError::command("FETCH", "connection reset"));
            }
            Ok(seqs
                .iter()
                .map(|&seq| RawMessage {
                    seq,
                    uid: Some(seq + 100),
                    ..RawMessage::default()
                })
                .collect())
        }
        fn store(&mut self, _: &[u32], _: FlagOp, _: &[&str]) -> Result<(), SessionError> {
            Ok(())
        }
        fn move_messages(&mut self, _: &[u32], _: IdKind, _: &str) -> Result<(), SessionError> {
            Ok(())
        }
        fn expunge(&mut self) -> Result<usize, SessionError> {
            Ok(0)
        }
        fn noop(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
        fn logout(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn session(total: u32, fail_on_batch: Option<usize>) -> NumberedSession {
        NumberedSession {
            total,
            fail_on_batch,
            batches: 0,
        }
    }

    #[test]
    fn delivers_every_message_in_order_through_a_small_buffer() {
        let mut s = session(25, None);
        let seqs: Vec<u32> = (1..=25).collect();
        let options = FetchOptions {
            batch_size: 4,
            channel_capacity: 1,
        };
        let mut got = Vec::new();
        let summary = stream_messages(&mut s, &seqs, &options, &CancelToken::new(), |m| {
            got.push(m.seq)
        })
        .unwrap();

        assert_eq!(summary, FetchSummary { requested: 25, delivered: 25 });
        assert_eq!(got, seqs);
        assert_eq!(s.batches, 7);
    }

    #[test]
    fn producer_error_surfaces_after_drain() {
        let mut s = session(10, Some(2));
        let seqs: Vec<u32> = (1..=10).collect();
        let options = FetchOptions {
            batch_size: 3,
            channel_capacity: 1,
        };
        let mut got = Vec::new();
        let err = stream_messages(&mut s, &seqs, &options, &CancelToken::new(), |m| {
            got.push(m.seq)
        })
        .unwrap_err();

        assert_eq!(got, vec![1, 2, 3]);
        assert!(matches!(err, FetchError::Session { delivered: 3, .. }));
    }

    #[test]
    fn cancellation_stops_the_stream() {
        let mut s = session(100, None);
        let seqs: Vec<u32> = (1..=100).collect();
        let options = FetchOptions {
            batch_size: 5,
            channel_capacity: 2,
        };
        let cancel = CancelToken::new();
        let mut got = 0;
        let err = stream_messages(&mut s, &seqs, &options, &cancel, |_| {
            got += 1;
            if got == 3 {
                cancel.cancel();
            }
        })
        .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert!(got < 100);
        assert!(s.batches < 20);
    }

    #[test]
    fn empty_request_does_not_touch_the_session() {
        let mut s = session(5, Some(1));
        let summary =
            stream_messages(&mut s, &[], &FetchOptions::default(), &CancelToken::new(), |_| {})
                .unwrap();
        assert_eq!(summary.delivered, 0);
        assert_eq!(s.batches, 0);
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn watchdog_cancels_after_timeout() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(50));

        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(token.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn watchdog_is_shared_by_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        token.cancel_after(Duration::from_millis(20));
        assert!(!worker.sleep(Duration::from_secs(5)));
    }
}
