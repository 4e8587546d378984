//! Mock hardware and ledger implementations for testing.
//!
//! These stand in for the RFID reader, the relay, the charger's power meter
//! and the remote ledger so the whole core can run without hardware. The
//! service binary uses them as its development backend as well.
//!
//! # Features
//!
//! - **Failure injection**: make any capability fail always, or for the next N calls
//! - **Latency simulation**: delay ledger calls to exercise timeouts
//! - **Call counters**: assert how often the relay was switched or the ledger written

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use kiosk_types::UserAccount;

use crate::error::{Error, Result};
use crate::traits::{CardReader, LedgerStore, PowerMeter, PowerSample, Relay};

/// Shared failure switch: permanent failure or a number of transient ones.
#[derive(Debug, Default)]
struct FailureSwitch {
    always: AtomicBool,
    remaining: AtomicU32,
}

impl FailureSwitch {
    fn set(&self, fail: bool) {
        self.always.store(fail, Ordering::Relaxed);
    }

    fn fail_next(&self, count: u32) {
        self.remaining.store(count, Ordering::Relaxed);
    }

    /// Whether the current call should fail. Consumes one transient failure.
    fn trip(&self) -> bool {
        let consumed = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        consumed || self.always.load(Ordering::Relaxed)
    }
}

// ==================== Reader ====================

/// A mock RFID reader.
///
/// A card can be *tapped* (seen on exactly one read) or *presented* (seen on
/// every read until removed). Taps are served before a held card.
///
/// # Example
///
/// ```
/// use kiosk_core::{CardReader, MockReader};
///
/// # #[tokio::main]
/// # async fn main() {
/// let reader = MockReader::new();
/// reader.tap("RFID001").await;
/// assert_eq!(reader.read().await.unwrap().as_deref(), Some("RFID001"));
/// assert_eq!(reader.read().await.unwrap(), None);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MockReader {
    taps: RwLock<VecDeque<String>>,
    held: RwLock<Option<String>>,
    read_count: AtomicU32,
    failure: FailureSwitch,
}

impl MockReader {
    /// Create a reader with nothing on it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a single sighting of a card.
    pub async fn tap(&self, token_id: impl Into<String>) {
        self.taps.write().await.push_back(token_id.into());
    }

    /// Hold a card on the reader.
    pub async fn present(&self, token_id: impl Into<String>) {
        *self.held.write().await = Some(token_id.into());
    }

    /// Take the held card away.
    pub async fn remove(&self) {
        *self.held.write().await = None;
    }

    /// Make every read fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.failure.set(fail);
    }

    /// Make the next `count` reads fail.
    pub fn fail_next(&self, count: u32) {
        self.failure.fail_next(count);
    }

    /// Number of reads performed.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CardReader for MockReader {
    async fn read(&self) -> Result<Option<String>> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        if self.failure.trip() {
            return Err(Error::Reader("mock reader failure".to_string()));
        }
        if let Some(token) = self.taps.write().await.pop_front() {
            return Ok(Some(token));
        }
        Ok(self.held.read().await.clone())
    }
}

// ==================== Relay ====================

/// A mock relay with switch counters.
#[derive(Debug, Default)]
pub struct MockRelay {
    enabled: AtomicBool,
    enable_count: AtomicU32,
    disable_count: AtomicU32,
    enable_failure: FailureSwitch,
    disable_failure: FailureSwitch,
}

impl MockRelay {
    /// Create an open (powered-off) relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the circuit is currently powered.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Number of `enable` calls, successful or not.
    pub fn enable_count(&self) -> u32 {
        self.enable_count.load(Ordering::Relaxed)
    }

    /// Number of `disable` calls, successful or not.
    pub fn disable_count(&self) -> u32 {
        self.disable_count.load(Ordering::Relaxed)
    }

    /// Make `enable` fail.
    pub fn set_enable_fails(&self, fail: bool) {
        self.enable_failure.set(fail);
    }

    /// Make `disable` fail. The relay still opens, as a stuck driver report.
    pub fn set_disable_fails(&self, fail: bool) {
        self.disable_failure.set(fail);
    }
}

#[async_trait]
impl Relay for MockRelay {
    async fn enable(&self) -> Result<()> {
        self.enable_count.fetch_add(1, Ordering::Relaxed);
        if self.enable_failure.trip() {
            return Err(Error::relay("enable", "mock relay did not close"));
        }
        self.enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.disable_count.fetch_add(1, Ordering::Relaxed);
        self.enabled.store(false, Ordering::Relaxed);
        if self.disable_failure.trip() {
            return Err(Error::relay("disable", "mock relay did not acknowledge"));
        }
        Ok(())
    }
}

// ==================== Meter ====================

/// A mock power meter delivering a fixed, adjustable sample.
#[derive(Debug)]
pub struct MockMeter {
    sample: RwLock<PowerSample>,
    state_of_charge: RwLock<Option<f64>>,
    sample_count: AtomicU32,
    failure: FailureSwitch,
}

impl Default for MockMeter {
    fn default() -> Self {
        Self::new(230.0, 3300.0)
    }
}

impl MockMeter {
    /// Create a meter that reports `power_w` at `voltage`.
    pub fn new(voltage: f64, power_w: f64) -> Self {
        Self {
            sample: RwLock::new(Self::sample_for(voltage, power_w)),
            state_of_charge: RwLock::new(None),
            sample_count: AtomicU32::new(0),
            failure: FailureSwitch::default(),
        }
    }

    fn sample_for(voltage: f64, power_w: f64) -> PowerSample {
        let current = if voltage > 0.0 { power_w / voltage } else { 0.0 };
        PowerSample {
            voltage,
            current,
            power_w,
        }
    }

    /// Change the reported power, keeping the voltage.
    pub async fn set_power(&self, power_w: f64) {
        let mut sample = self.sample.write().await;
        *sample = Self::sample_for(sample.voltage, power_w);
    }

    /// Replace the reported sample.
    pub async fn set_sample(&self, sample: PowerSample) {
        *self.sample.write().await = sample;
    }

    /// Report a vehicle state of charge.
    pub async fn set_state_of_charge(&self, percent: Option<f64>) {
        *self.state_of_charge.write().await = percent;
    }

    /// Make every sample fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.failure.set(fail);
    }

    /// Make the next `count` samples fail.
    pub fn fail_next(&self, count: u32) {
        self.failure.fail_next(count);
    }

    /// Number of samples taken.
    pub fn sample_count(&self) -> u32 {
        self.sample_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PowerMeter for MockMeter {
    async fn sample(&self) -> Result<PowerSample> {
        self.sample_count.fetch_add(1, Ordering::Relaxed);
        if self.failure.trip() {
            return Err(Error::Meter("mock meter failure".to_string()));
        }
        Ok(*self.sample.read().await)
    }

    async fn state_of_charge(&self) -> Result<Option<f64>> {
        Ok(*self.state_of_charge.read().await)
    }
}

// ==================== Ledger ====================

/// An in-memory ledger store.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: RwLock<BTreeMap<String, UserAccount>>,
    writes: RwLock<Vec<(String, f64)>>,
    list_count: AtomicU32,
    write_count: AtomicU32,
    append_count: AtomicU32,
    read_failure: FailureSwitch,
    write_failure: FailureSwitch,
    latency_ms: AtomicU64,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger holding the given accounts.
    pub fn with_accounts(accounts: impl IntoIterator<Item = UserAccount>) -> Self {
        let map = accounts
            .into_iter()
            .map(|a| (a.token_id.clone(), a))
            .collect();
        Self {
            accounts: RwLock::new(map),
            ..Default::default()
        }
    }

    /// Insert or replace an account directly, bypassing counters.
    pub async fn insert(&self, account: UserAccount) {
        self.accounts
            .write()
            .await
            .insert(account.token_id.clone(), account);
    }

    /// Balance currently stored for a token.
    pub async fn balance(&self, token_id: &str) -> Option<f64> {
        self.accounts.read().await.get(token_id).map(|a| a.balance)
    }

    /// Every successful balance write, in order.
    pub async fn writes(&self) -> Vec<(String, f64)> {
        self.writes.read().await.clone()
    }

    /// Make every read fail.
    pub fn set_reads_fail(&self, fail: bool) {
        self.read_failure.set(fail);
    }

    /// Make every write (balance or append) fail.
    pub fn set_writes_fail(&self, fail: bool) {
        self.write_failure.set(fail);
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.write_failure.fail_next(count);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of `list_accounts` calls.
    pub fn list_count(&self) -> u32 {
        self.list_count.load(Ordering::Relaxed)
    }

    /// Number of `write_balance` calls, successful or not.
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Number of `append_account` calls, successful or not.
    pub fn append_count(&self) -> u32 {
        self.append_count.load(Ordering::Relaxed)
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn list_accounts(&self) -> Result<Vec<UserAccount>> {
        self.list_count.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        if self.read_failure.trip() {
            return Err(Error::LedgerUnavailable("mock ledger read failure".to_string()));
        }
        Ok(self.accounts.read().await.values().cloned().collect())
    }

    async fn write_balance(&self, token_id: &str, balance: f64) -> Result<()> {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        if self.write_failure.trip() {
            return Err(Error::ledger_write(token_id, "mock ledger write failure"));
        }
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(token_id)
            .ok_or_else(|| Error::UnknownIdentity(token_id.to_string()))?;
        account.balance = balance;
        self.writes
            .write()
            .await
            .push((token_id.to_string(), balance));
        Ok(())
    }

    async fn append_account(
        &self,
        token_id: &str,
        name: &str,
        contact: Option<&str>,
        balance: f64,
    ) -> Result<()> {
        self.append_count.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        if self.write_failure.trip() {
            return Err(Error::ledger_write(token_id, "mock ledger append failure"));
        }
        let mut accounts = self.accounts.write().await;
        accounts
            .entry(token_id.to_string())
            .or_insert_with(|| UserAccount {
                token_id: token_id.to_string(),
                name: name.to_string(),
                contact: contact.map(str::to_string),
                balance: balance.max(0.0),
                created_at: OffsetDateTime::now_utc(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_tap_is_seen_once() {
        let reader = MockReader::new();
        reader.tap("A").await;
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("A"));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.read_count(), 2);
    }

    #[tokio::test]
    async fn test_reader_held_card_is_seen_until_removed() {
        let reader = MockReader::new();
        reader.present("A").await;
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("A"));
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("A"));
        reader.remove().await;
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_transient_failures() {
        let reader = MockReader::new();
        reader.fail_next(2);
        assert!(reader.read().await.is_err());
        assert!(reader.read().await.is_err());
        assert!(reader.read().await.is_ok());
    }

    #[tokio::test]
    async fn test_relay_counts_and_failures() {
        let relay = MockRelay::new();
        relay.enable().await.unwrap();
        assert!(relay.is_enabled());
        relay.disable().await.unwrap();
        relay.disable().await.unwrap();
        assert!(!relay.is_enabled());
        assert_eq!(relay.enable_count(), 1);
        assert_eq!(relay.disable_count(), 2);

        relay.set_enable_fails(true);
        assert!(matches!(
            relay.enable().await,
            Err(Error::RelayFault { operation: "enable", .. })
        ));
        assert!(!relay.is_enabled());
    }

    #[tokio::test]
    async fn test_meter_sample() {
        let meter = MockMeter::new(230.0, 2300.0);
        let sample = meter.sample().await.unwrap();
        assert!((sample.current - 10.0).abs() < 1e-9);

        meter.set_power(0.0).await;
        assert_eq!(meter.sample().await.unwrap().power_w, 0.0);
        assert_eq!(meter.state_of_charge().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ledger_write_and_append() {
        let ledger =
            MemoryLedger::with_accounts([UserAccount::new("A", "Asha").with_balance(80.0)]);
        ledger.write_balance("A", 40.0).await.unwrap();
        assert_eq!(ledger.balance("A").await, Some(40.0));
        assert_eq!(ledger.writes().await, vec![("A".to_string(), 40.0)]);

        assert!(ledger.write_balance("Z", 1.0).await.is_err());

        ledger.append_account("B", "Ravi", None, 0.0).await.unwrap();
        assert_eq!(ledger.list_accounts().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ledger_failure_injection() {
        let ledger = MemoryLedger::with_accounts([UserAccount::new("A", "Asha")]);
        ledger.fail_next_writes(1);
        assert!(matches!(
            ledger.write_balance("A", 5.0).await,
            Err(Error::LedgerWriteFailed { .. })
        ));
        ledger.write_balance("A", 5.0).await.unwrap();
        assert_eq!(ledger.write_count(), 2);

        ledger.set_reads_fail(true);
        assert!(matches!(
            ledger.list_accounts().await,
            Err(Error::LedgerUnavailable(_))
        ));
    }
}
