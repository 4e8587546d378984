//! Core types for accounts and charging sessions.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ParseError;

/// A user account as held by the ledger.
///
/// The identity token is the account's primary key: it is the value read from
/// the presented RFID card and is stable for the life of the account.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UserAccount {
    /// Identity token read from the card.
    pub token_id: String,
    /// Display name.
    pub name: String,
    /// Optional contact (phone number or email).
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub contact: Option<String>,
    /// Monetary balance in rupees. Never negative.
    pub balance: f64,
    /// When the account was created.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub created_at: OffsetDateTime,
}

impl UserAccount {
    /// Create a new zero-balance account created now.
    pub fn new(token_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            name: name.into(),
            contact: None,
            balance: 0.0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Set the balance (negative values clamp to zero).
    #[must_use]
    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = balance.max(0.0);
        self
    }

    /// Set the contact.
    #[must_use]
    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    /// Whether the account has any money to spend.
    pub fn is_funded(&self) -> bool {
        self.balance > 0.0
    }
}

/// Lifecycle status of a charging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SessionStatus {
    /// The relay is engaged and the session is being metered.
    InProgress,
    /// The session ended on its own (target reached or credit used up).
    Completed,
    /// The session was ended early by the user, an operator or shutdown.
    Stopped,
}

impl SessionStatus {
    /// Stable string form, as used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            other => Err(ParseError::unknown("session status", other)),
        }
    }
}

/// Why a session ended.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum StopReason {
    /// The estimated battery level reached the paid-for target.
    TargetReached,
    /// The paid credit was fully consumed.
    BalanceExhausted,
    /// The session owner presented their card again.
    UserRescan,
    /// An operator or UI issued a stop command.
    Operator,
    /// The service is shutting down.
    Shutdown,
}

impl StopReason {
    /// The terminal status a session reaches for this reason.
    ///
    /// Automatic stops complete the session; everything else stops it.
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::TargetReached | Self::BalanceExhausted => SessionStatus::Completed,
            Self::UserRescan | Self::Operator | Self::Shutdown => SessionStatus::Stopped,
        }
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TargetReached => "target_reached",
            Self::BalanceExhausted => "balance_exhausted",
            Self::UserRescan => "user_rescan",
            Self::Operator => "operator",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopReason {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target_reached" => Ok(Self::TargetReached),
            "balance_exhausted" => Ok(Self::BalanceExhausted),
            "user_rescan" => Ok(Self::UserRescan),
            "operator" => Ok(Self::Operator),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(ParseError::unknown("stop reason", other)),
        }
    }
}

/// Whether a session's final balance has reached the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LedgerSync {
    /// Session still running; nothing to settle yet.
    #[default]
    Pending,
    /// The final balance was written.
    Synced,
    /// The settlement write failed and is being retried.
    Unsynced,
    /// Retries were exhausted; an operator must reconcile the balance.
    NeedsReconciliation,
}

impl LedgerSync {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Unsynced => "unsynced",
            Self::NeedsReconciliation => "needs_reconciliation",
        }
    }
}

impl fmt::Display for LedgerSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerSync {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "unsynced" => Ok(Self::Unsynced),
            "needs_reconciliation" => Ok(Self::NeedsReconciliation),
            other => Err(ParseError::unknown("ledger sync state", other)),
        }
    }
}

/// A single charging session.
///
/// Created by the session state machine when a funded identity is accepted
/// while the circuit is idle, updated on every metering tick, and frozen when
/// the session is settled.
///
/// Money fields:
/// - `paid_amount` is debited from the account when the session starts.
/// - `credit_remaining` is the part of `paid_amount` not yet consumed.
/// - `remaining_balance` is what the account holds once the session is settled
///   (balance left after the debit plus the unspent credit).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChargingSession {
    /// Unique session id.
    pub id: Uuid,
    /// Identity token of the owning account.
    pub token_id: String,
    /// Display name of the owner at session start.
    pub user_name: String,
    /// Amount paid up front. Immutable after creation.
    pub paid_amount: f64,
    /// Estimated battery level (%) when the session started.
    pub start_battery: f64,
    /// Battery level (%) the paid amount buys.
    pub target_battery: f64,
    /// Latest battery estimate (%).
    pub end_battery: f64,
    /// Energy delivered so far, in watt-hours.
    pub energy_delivered_wh: f64,
    /// Last sampled voltage (V).
    pub voltage: f64,
    /// Last sampled current (A).
    pub current: f64,
    /// Last sampled power (W).
    pub power_w: f64,
    /// Unspent part of the paid amount.
    pub credit_remaining: f64,
    /// Account balance after settlement at the current consumption.
    pub remaining_balance: f64,
    /// Session status.
    pub status: SessionStatus,
    /// Why the session ended, once it has.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub stop_reason: Option<StopReason>,
    /// Ledger settlement state.
    #[cfg_attr(feature = "serde", serde(default))]
    pub ledger_sync: LedgerSync,
    /// When the session started.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub started_at: OffsetDateTime,
    /// When the session ended (None while in progress).
    #[cfg_attr(
        feature = "serde",
        serde(default, with = "time::serde::rfc3339::option")
    )]
    pub ended_at: Option<OffsetDateTime>,
}

impl ChargingSession {
    /// Whether the session is still in progress.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::InProgress
    }

    /// Amount of the paid credit consumed so far.
    pub fn consumed(&self) -> f64 {
        (self.paid_amount - self.credit_remaining).max(0.0)
    }

    /// Session duration, up to `now` while still running.
    pub fn duration(&self, now: OffsetDateTime) -> time::Duration {
        self.ended_at.unwrap_or(now) - self.started_at
    }

    /// Whether settlement still owes the ledger a write.
    pub fn is_unsynced(&self) -> bool {
        matches!(
            self.ledger_sync,
            LedgerSync::Unsynced | LedgerSync::NeedsReconciliation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ChargingSession {
        ChargingSession {
            id: Uuid::new_v4(),
            token_id: "RFID001".to_string(),
            user_name: "Asha".to_string(),
            paid_amount: 40.0,
            start_battery: 35.0,
            target_battery: 75.0,
            end_battery: 40.0,
            energy_delivered_wh: 1500.0,
            voltage: 230.0,
            current: 14.3,
            power_w: 3300.0,
            credit_remaining: 22.0,
            remaining_balance: 82.0,
            status: SessionStatus::InProgress,
            stop_reason: None,
            ledger_sync: LedgerSync::Pending,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
        }
    }

    #[test]
    fn test_account_balance_clamped() {
        let account = UserAccount::new("RFID001", "Asha").with_balance(-5.0);
        assert_eq!(account.balance, 0.0);
        assert!(!account.is_funded());

        let funded = account.with_balance(10.0);
        assert!(funded.is_funded());
    }

    #[test]
    fn test_session_status_round_trip_strings() {
        for status in [
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("charging".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_stop_reason_maps_to_status() {
        assert_eq!(StopReason::TargetReached.status(), SessionStatus::Completed);
        assert_eq!(StopReason::BalanceExhausted.status(), SessionStatus::Completed);
        assert_eq!(StopReason::UserRescan.status(), SessionStatus::Stopped);
        assert_eq!(StopReason::Operator.status(), SessionStatus::Stopped);
        assert_eq!(StopReason::Shutdown.status(), SessionStatus::Stopped);
    }

    #[test]
    fn test_parse_error_names_the_value() {
        let err = "sideways".parse::<LedgerSync>().unwrap_err();
        assert!(err.to_string().contains("sideways"));
        assert!(err.to_string().contains("ledger sync"));
    }

    #[test]
    fn test_session_consumed() {
        let s = session();
        assert!((s.consumed() - 18.0).abs() < 1e-9);
        assert!(s.is_active());
        assert!(!s.is_unsynced());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_session_serializes_snake_case_status() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["ledger_sync"], "pending");
        assert!(json.get("stop_reason").is_none());
        assert!(json["started_at"].is_string());
    }
}
