//! Balance cache over the remote ledger store.
//!
//! The ledger is a slow, remote key-value store. [`LedgerCache`] keeps a
//! snapshot of every account and serves reads from it while it is fresh:
//!
//! - a snapshot is fresh while it is younger than the TTL and no write has
//!   invalidated it since it was fetched;
//! - a stale read triggers one full refetch, concurrent readers wait on the
//!   same refetch instead of issuing their own;
//! - if the refetch fails the previous snapshot is served with a warning, and
//!   only when there never was a snapshot does the read fail;
//! - every write goes straight to the store and then invalidates, so the next
//!   read observes it.
//!
//! Snapshots are immutable and swapped as a whole `Arc`, so a reader sees
//! either the old or the new account set, never a mix.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kiosk_types::UserAccount;

use crate::error::{Error, Result};
use crate::traits::LedgerStore;

/// Cache timing configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a snapshot is served without refetching.
    pub ttl: Duration,
    /// Period of the background refresh.
    pub refresh_interval: Duration,
    /// Upper bound on every remote call.
    pub remote_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct Snapshot {
    accounts: HashMap<String, UserAccount>,
    fetched_at: Instant,
    fetched_wall: OffsetDateTime,
    generation: u64,
}

#[derive(Debug, Default)]
struct Health {
    last_success: Option<OffsetDateTime>,
    last_failure: Option<OffsetDateTime>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

/// Freshness metadata for operators.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Whether any snapshot has been loaded.
    pub loaded: bool,
    /// Seconds since the current snapshot was fetched.
    pub age_secs: Option<f64>,
    /// Configured TTL in seconds.
    pub ttl_secs: f64,
    /// Configured background refresh period in seconds.
    pub refresh_interval_secs: f64,
    /// Accounts in the current snapshot.
    pub account_count: usize,
    /// Whether a write has invalidated the snapshot since it was fetched.
    pub invalidated: bool,
    /// Whether the next read will refetch.
    pub stale: bool,
    /// Wall-clock time of the current snapshot's fetch.
    #[serde(with = "time::serde::rfc3339::option")]
    pub fetched_at: Option<OffsetDateTime>,
    /// Last successful refetch.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    /// Last failed refetch.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
    /// Message of the last refetch failure.
    pub last_error: Option<String>,
}

/// Read-through cache of ledger accounts.
pub struct LedgerCache {
    store: Arc<dyn LedgerStore>,
    config: CacheConfig,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    generation: AtomicU64,
    refresh_lock: Mutex<()>,
    health: RwLock<Health>,
}

impl std::fmt::Debug for LedgerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerCache")
            .field("config", &self.config)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl LedgerCache {
    /// Create an empty cache over `store`. Nothing is fetched until first use.
    pub fn new(store: Arc<dyn LedgerStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            health: RwLock::new(Health::default()),
        }
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up one account. Serves the last snapshot when the ledger is down.
    pub async fn get(&self, token_id: &str) -> Result<Option<UserAccount>> {
        let snapshot = self.load(true).await?;
        Ok(snapshot.accounts.get(token_id).cloned())
    }

    /// Look up one account from a fresh snapshot, for authorizing a debit.
    ///
    /// Fails with [`Error::LedgerUnavailable`] instead of serving a stale
    /// snapshot.
    pub async fn get_fresh(&self, token_id: &str) -> Result<Option<UserAccount>> {
        let snapshot = self.load(false).await?;
        Ok(snapshot.accounts.get(token_id).cloned())
    }

    /// Every account, ordered by token.
    pub async fn accounts(&self) -> Result<Vec<UserAccount>> {
        let snapshot = self.load(true).await?;
        let mut accounts: Vec<UserAccount> = snapshot.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.token_id.cmp(&b.token_id));
        Ok(accounts)
    }

    /// Write an absolute balance to the ledger, then invalidate.
    ///
    /// Negative balances are clamped to zero.
    pub async fn adjust_balance(&self, token_id: &str, new_balance: f64) -> Result<f64> {
        let balance = new_balance.max(0.0);
        let result = self
            .remote("write_balance", self.store.write_balance(token_id, balance))
            .await;
        self.invalidate();

        match result {
            Ok(()) => {
                debug!("Ledger balance for {} set to {:.2}", token_id, balance);
                Ok(balance)
            }
            Err(e @ Error::LedgerWriteFailed { .. }) | Err(e @ Error::UnknownIdentity(_)) => {
                Err(e)
            }
            Err(e) => Err(Error::ledger_write(token_id, e.to_string())),
        }
    }

    /// Return the account for `token_id`, creating a zero-balance record if absent.
    pub async fn create_if_absent(&self, token_id: &str, default_name: &str) -> Result<UserAccount> {
        let (account, _) = self.provision(token_id, default_name, None, 0.0).await?;
        Ok(account)
    }

    /// Create an account unless one exists.
    ///
    /// Returns the account and whether it was newly created.
    pub async fn provision(
        &self,
        token_id: &str,
        name: &str,
        contact: Option<&str>,
        balance: f64,
    ) -> Result<(UserAccount, bool)> {
        if let Some(existing) = self.get(token_id).await? {
            return Ok((existing, false));
        }

        let balance = balance.max(0.0);
        let result = self
            .remote(
                "append_account",
                self.store.append_account(token_id, name, contact, balance),
            )
            .await;
        self.invalidate();
        if let Err(e) = result {
            return Err(match e {
                e @ Error::LedgerWriteFailed { .. } => e,
                other => Error::ledger_write(token_id, other.to_string()),
            });
        }
        info!("Provisioned account {} ({})", token_id, name);

        // The store may not reflect the append yet; fall back to the record we sent.
        let account = match self.get(token_id).await {
            Ok(Some(account)) => account,
            _ => {
                let mut account = UserAccount::new(token_id, name).with_balance(balance);
                account.contact = contact.map(str::to_string);
                account
            }
        };
        Ok((account, true))
    }

    /// Force the next read to go to the remote store.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Refetch now, regardless of freshness.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch().await.map(|_| ())
    }

    /// Freshness metadata.
    pub async fn status(&self) -> CacheStatus {
        let snapshot = self.snapshot.read().await.clone();
        let health = self.health.read().await;
        let generation = self.generation.load(Ordering::Acquire);

        let (age, count, invalidated, fetched_at) = match &snapshot {
            Some(s) => (
                Some(s.fetched_at.elapsed()),
                s.accounts.len(),
                s.generation != generation,
                Some(s.fetched_wall),
            ),
            None => (None, 0, false, None),
        };
        let stale = match age {
            Some(age) => invalidated || age >= self.config.ttl,
            None => true,
        };

        CacheStatus {
            loaded: snapshot.is_some(),
            age_secs: age.map(|a| a.as_secs_f64()),
            ttl_secs: self.config.ttl.as_secs_f64(),
            refresh_interval_secs: self.config.refresh_interval.as_secs_f64(),
            account_count: count,
            invalidated,
            stale,
            fetched_at,
            last_success: health.last_success,
            last_failure: health.last_failure,
            last_error: health.last_error.clone(),
        }
    }

    /// Spawn the periodic background refresh.
    pub fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let period = cache.config.refresh_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Ledger cache refresh every {:?}", period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Ledger cache refresh stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are recorded and logged inside fetch()
                        let _ = cache.refresh().await;
                    }
                }
            }
        })
    }

    fn fresh(&self, snapshot: &Snapshot) -> bool {
        snapshot.generation == self.generation.load(Ordering::Acquire)
            && snapshot.fetched_at.elapsed() < self.config.ttl
    }

    async fn current_fresh(&self) -> Option<Arc<Snapshot>> {
        let guard = self.snapshot.read().await;
        guard.as_ref().filter(|s| self.fresh(s)).cloned()
    }

    async fn load(&self, allow_stale: bool) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.current_fresh().await {
            return Ok(snapshot);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another reader may have refetched while we waited
        if let Some(snapshot) = self.current_fresh().await {
            return Ok(snapshot);
        }

        match self.fetch().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => match self.snapshot.read().await.clone() {
                Some(stale) if allow_stale => {
                    warn!(
                        "Serving stale ledger snapshot ({:.1}s old): {}",
                        stale.fetched_at.elapsed().as_secs_f64(),
                        e
                    );
                    Ok(stale)
                }
                _ => Err(match e {
                    e @ Error::LedgerUnavailable(_) => e,
                    other => Error::LedgerUnavailable(other.to_string()),
                }),
            },
        }
    }

    /// Fetch every account and swap the snapshot. Caller holds `refresh_lock`.
    async fn fetch(&self) -> Result<Arc<Snapshot>> {
        let generation = self.generation.load(Ordering::Acquire);
        let result = self
            .remote("list_accounts", self.store.list_accounts())
            .await;

        match result {
            Ok(accounts) => {
                let snapshot = Arc::new(Snapshot {
                    accounts: accounts
                        .into_iter()
                        .map(|a| (a.token_id.clone(), a))
                        .collect(),
                    fetched_at: Instant::now(),
                    fetched_wall: OffsetDateTime::now_utc(),
                    generation,
                });
                *self.snapshot.write().await = Some(Arc::clone(&snapshot));

                let mut health = self.health.write().await;
                if health.consecutive_failures > 0 {
                    info!(
                        "Ledger reachable again after {} failed fetch(es)",
                        health.consecutive_failures
                    );
                }
                health.consecutive_failures = 0;
                health.last_success = Some(snapshot.fetched_wall);
                debug!("Ledger snapshot refreshed: {} account(s)", snapshot.accounts.len());
                Ok(snapshot)
            }
            Err(e) => {
                let mut health = self.health.write().await;
                health.consecutive_failures += 1;
                health.last_failure = Some(OffsetDateTime::now_utc());
                health.last_error = Some(e.to_string());
                if health.consecutive_failures <= 3 {
                    warn!(
                        "Ledger fetch failed: {} (attempt {})",
                        e, health.consecutive_failures
                    );
                } else if health.consecutive_failures == 4 {
                    error!(
                        "Ledger fetch failed {} times in a row, continuing on the last snapshot",
                        health.consecutive_failures
                    );
                }
                Err(e)
            }
        }
    }

    async fn remote<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.config.remote_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| Error::timeout(operation, limit))?
    }
}
