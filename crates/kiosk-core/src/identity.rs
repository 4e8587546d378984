//! Debounced identity events from the card reader.
//!
//! The reader is polled on a fixed interval. A card resting on the reader is
//! seen on every poll, so raw reads are collapsed into logical presentations
//! by a [`Debouncer`] before being resolved against the ledger cache and
//! handed to the runtime over a bounded channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kiosk_types::IdentityEvent;

use crate::error::Result;
use crate::ledger::LedgerCache;
use crate::traits::CardReader;

/// Shortest allowed poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Longest allowed poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Name given to auto-provisioned accounts.
const PROVISIONED_NAME: &str = "New user";

/// Reader polling configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// How often the reader is polled.
    pub poll_interval: Duration,
    /// How long a token stays suppressed after it was last seen.
    pub debounce: Duration,
    /// Create a zero-balance account for unknown tokens.
    pub auto_provision_unknown: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            debounce: Duration::from_secs(2),
            auto_provision_unknown: false,
        }
    }
}

/// Collapses repeated reads of the same token.
///
/// A read is a new presentation when the token differs from the last one
/// emitted, or when the window has passed since that token was last emitted.
/// Suppressed reads leave the window untouched, so a card held on the reader
/// presents again once per window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl Debouncer {
    /// Create a debouncer with the given window.
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record a read at `now`; returns whether it is a new presentation.
    pub fn observe(&mut self, token_id: &str, now: Instant) -> bool {
        let fresh = match &self.last {
            Some((last, emitted)) if last == token_id => {
                now.saturating_duration_since(*emitted) >= self.window
            }
            _ => true,
        };
        if fresh {
            self.last = Some((token_id.to_string(), now));
        }
        fresh
    }

    /// Forget the last token.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Polls a [`CardReader`] and emits resolved [`IdentityEvent`]s.
pub struct IdentitySource {
    reader: Arc<dyn CardReader>,
    ledger: Arc<LedgerCache>,
    config: ReaderConfig,
    sender: mpsc::Sender<IdentityEvent>,
}

impl IdentitySource {
    /// Create a source. The poll interval is clamped to 100 ms – 1 s.
    pub fn new(
        reader: Arc<dyn CardReader>,
        ledger: Arc<LedgerCache>,
        mut config: ReaderConfig,
        sender: mpsc::Sender<IdentityEvent>,
    ) -> Self {
        let clamped = config
            .poll_interval
            .clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        if clamped != config.poll_interval {
            warn!(
                "Reader poll interval {:?} out of range, using {:?}",
                config.poll_interval, clamped
            );
            config.poll_interval = clamped;
        }
        Self {
            reader,
            ledger,
            config,
            sender,
        }
    }

    /// Resolve a token against the ledger cache.
    ///
    /// Unknown tokens are provisioned with a zero balance when configured to,
    /// but still reported as unknown.
    pub async fn resolve(&self, token_id: &str) -> Result<IdentityEvent> {
        let account = self.ledger.get(token_id).await?;
        if account.is_none() && self.config.auto_provision_unknown {
            match self.ledger.create_if_absent(token_id, PROVISIONED_NAME).await {
                Ok(_) => info!("Provisioned unknown card {}", token_id),
                Err(e) => warn!("Failed to provision card {}: {}", token_id, e),
            }
        }
        Ok(IdentityEvent::resolve(token_id, account))
    }

    /// Spawn the polling loop. It runs until `cancel` fires or the receiver
    /// is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            "Polling card reader every {:?} (debounce {:?})",
            self.config.poll_interval, self.config.debounce
        );
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut debouncer = Debouncer::new(self.config.debounce);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Identity source stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let token = match self.reader.read().await {
                Ok(token) => {
                    if consecutive_failures > 0 {
                        info!("Card reader recovered after {} failure(s)", consecutive_failures);
                    }
                    consecutive_failures = 0;
                    token
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures <= 3 {
                        warn!("Card read failed: {} (attempt {})", e, consecutive_failures);
                    } else if consecutive_failures == 4 {
                        error!(
                            "Card read failed {} times in a row, will continue trying silently",
                            consecutive_failures
                        );
                    }
                    continue;
                }
            };

            let Some(token) = token else { continue };
            if !debouncer.observe(&token, Instant::now()) {
                continue;
            }

            let event = match self.resolve(&token).await {
                Ok(event) => event,
                Err(e) => {
                    warn!("Dropping presentation of {}: {}", token, e);
                    continue;
                }
            };
            debug!("Card {} resolved as {:?}", token, event.outcome);

            if self.sender.send(event).await.is_err() {
                debug!("Identity receiver dropped, stopping reader loop");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CacheConfig;
    use crate::mock::{MemoryLedger, MockReader};
    use crate::traits::LedgerStore;
    use kiosk_types::{IdentityOutcome, UserAccount};

    #[test]
    fn test_debouncer_collapses_repeats() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(2));

        assert!(debouncer.observe("A", start));
        assert!(!debouncer.observe("A", start + Duration::from_millis(500)));
        assert!(debouncer.observe("B", start + Duration::from_millis(600)));
        assert!(debouncer.observe("A", start + Duration::from_millis(700)));
    }

    #[test]
    fn test_debouncer_window_measured_from_last_emission() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(2));
        let at = |ms: u64| start + Duration::from_millis(ms);

        // Card held and seen every 250 ms for 3 s
        let emitted: Vec<u64> = (0..=12)
            .map(|i| i * 250)
            .filter(|ms| debouncer.observe("A", at(*ms)))
            .collect();
        assert_eq!(emitted, vec![0, 2000]);
    }

    #[test]
    fn test_debouncer_reset() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(2));
        assert!(debouncer.observe("A", start));
        debouncer.reset();
        assert!(debouncer.observe("A", start));
    }

    fn source(
        reader: Arc<MockReader>,
        ledger: Arc<MemoryLedger>,
        config: ReaderConfig,
    ) -> (IdentitySource, mpsc::Receiver<IdentityEvent>) {
        let cache = Arc::new(LedgerCache::new(
            ledger as Arc<dyn LedgerStore>,
            CacheConfig::default(),
        ));
        let (tx, rx) = mpsc::channel(16);
        (IdentitySource::new(reader, cache, config, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_card_presents_once_per_window() {
        let reader = Arc::new(MockReader::new());
        let ledger = Arc::new(MemoryLedger::with_accounts([
            UserAccount::new("RFID001", "Asha").with_balance(80.0),
        ]));
        let (source, mut rx) = source(Arc::clone(&reader), ledger, ReaderConfig::default());
        let cancel = CancellationToken::new();
        let handle = source.spawn(cancel.clone());

        reader.present("RFID001").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Presented at 0 s, 2 s and 4 s
        let mut presentations = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.outcome, IdentityOutcome::Accepted);
            presentations += 1;
        }
        assert_eq!(presentations, 3);
        assert!(reader.read_count() > 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_card_is_provisioned_when_enabled() {
        let reader = Arc::new(MockReader::new());
        let ledger = Arc::new(MemoryLedger::new());
        let config = ReaderConfig {
            auto_provision_unknown: true,
            ..ReaderConfig::default()
        };
        let (source, mut rx) = source(Arc::clone(&reader), Arc::clone(&ledger), config);
        let cancel = CancellationToken::new();
        let handle = source.spawn(cancel.clone());

        reader.tap("CARD9").await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.outcome, IdentityOutcome::RejectedUnknown);
        assert_eq!(ledger.balance("CARD9").await, Some(0.0));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_errors_count_as_no_read() {
        let reader = Arc::new(MockReader::new());
        let ledger = Arc::new(MemoryLedger::with_accounts([
            UserAccount::new("RFID001", "Asha").with_balance(80.0),
        ]));
        let (source, mut rx) = source(Arc::clone(&reader), ledger, ReaderConfig::default());
        reader.fail_next(5);
        reader.tap("RFID001").await;

        let cancel = CancellationToken::new();
        let handle = source.spawn(cancel.clone());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.token_id, "RFID001");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_ledger_drops_presentation() {
        let reader = Arc::new(MockReader::new());
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_reads_fail(true);
        let (source, mut rx) = source(Arc::clone(&reader), ledger, ReaderConfig::default());

        let cancel = CancellationToken::new();
        let handle = source.spawn(cancel.clone());
        reader.tap("RFID001").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_poll_interval_is_clamped() {
        let config = ReaderConfig {
            poll_interval: Duration::from_millis(10),
            ..ReaderConfig::default()
        };
        let (source, _rx) = source(
            Arc::new(MockReader::new()),
            Arc::new(MemoryLedger::new()),
            config,
        );
        assert_eq!(source.config.poll_interval, MIN_POLL_INTERVAL);
    }
}
