//! Capability traits for the hardware and the remote ledger.
//!
//! The core never talks to a GPIO pin, an RFID chip or a database directly.
//! It calls through these narrow traits so that real drivers, the SQLite
//! ledger, the HTTP ledger client and the mocks in [`crate::mock`] are
//! interchangeable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiosk_types::UserAccount;

use crate::error::Result;

/// A polled identity-token reader (e.g. an MFRC522 RFID module).
#[async_trait]
pub trait CardReader: Send + Sync {
    /// Read the token currently presented, if any.
    ///
    /// Must not block waiting for a card: return `Ok(None)` when nothing is
    /// on the reader.
    async fn read(&self) -> Result<Option<String>>;
}

/// The relay switching the charging circuit.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Close the relay (power on).
    async fn enable(&self) -> Result<()>;

    /// Open the relay (power off).
    ///
    /// Must be idempotent and callable even if the relay was never enabled.
    async fn disable(&self) -> Result<()>;
}

/// One instantaneous reading of the charging circuit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerSample {
    /// Voltage in volts.
    pub voltage: f64,
    /// Current in amperes.
    pub current: f64,
    /// Active power in watts.
    pub power_w: f64,
}

impl PowerSample {
    /// Build a sample from voltage and current (power = V × I).
    pub fn from_vi(voltage: f64, current: f64) -> Self {
        Self {
            voltage,
            current,
            power_w: voltage * current,
        }
    }
}

/// The charger's measurement side.
#[async_trait]
pub trait PowerMeter: Send + Sync {
    /// Sample voltage, current and power.
    async fn sample(&self) -> Result<PowerSample>;

    /// Vehicle state of charge in percent, when the charger can report it.
    ///
    /// The default implementation reports nothing, in which case the session
    /// starts from the configured baseline.
    async fn state_of_charge(&self) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// The remote key-value ledger holding account balances.
///
/// Writes are absolute: `write_balance` replaces the stored balance.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch every account.
    async fn list_accounts(&self) -> Result<Vec<UserAccount>>;

    /// Replace one account's balance.
    async fn write_balance(&self, token_id: &str, balance: f64) -> Result<()>;

    /// Append a new account record.
    async fn append_account(
        &self,
        token_id: &str,
        name: &str,
        contact: Option<&str>,
        balance: f64,
    ) -> Result<()>;
}
