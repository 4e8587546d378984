//! Error types for kiosk-core.
//!
//! The taxonomy separates user-facing outcomes from faults.
//!
//! # Propagation Policy
//!
//! | Error Type | Where it shows up | Handling |
//! |------------|-------------------|----------|
//! | [`Error::UnknownIdentity`] | manual start, identity resolution | Event stream only, not a fault |
//! | [`Error::InsufficientBalance`] | start transition | Event stream only, not a fault |
//! | [`Error::RelayFault`] | relay enable / disable | Start: abort (fail closed) + alert. Stop: log + alert, still settle |
//! | [`Error::LedgerUnavailable`] | cache refetch | Serve the stale snapshot with a warning |
//! | [`Error::LedgerWriteFailed`] | debit / settlement write | Debit: abort start. Settlement: mark unsynced, retry with backoff |
//! | [`Error::ConcurrentSessionConflict`] | start while not idle | Reject with "circuit busy", never queued |
//!
//! ## Retry Classification
//!
//! [`crate::with_retry`] retries errors for which [`Error::is_transient`]
//! holds (ledger, reader, meter, relay and timeout errors). Identity, balance,
//! conflict and configuration errors are final.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the kiosk core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The presented token is not in the ledger.
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// The account cannot pay for a session.
    #[error("Insufficient balance for {token_id}: {balance:.2} available")]
    InsufficientBalance {
        /// Account token.
        token_id: String,
        /// Balance at the time of the check.
        balance: f64,
    },

    /// The relay capability failed.
    #[error("Relay fault during {operation}: {reason}")]
    RelayFault {
        /// `"enable"` or `"disable"`.
        operation: &'static str,
        /// Driver-provided reason.
        reason: String,
    },

    /// The remote ledger could not be read.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The remote ledger rejected or timed out on a write.
    #[error("Ledger write failed for {token_id}: {reason}")]
    LedgerWriteFailed {
        /// Account token being written.
        token_id: String,
        /// Why the write failed.
        reason: String,
    },

    /// A start was attempted while the circuit is not idle.
    #[error("Circuit busy: session {active_session} is {state}")]
    ConcurrentSessionConflict {
        /// Session currently holding the circuit.
        active_session: Uuid,
        /// State name of the machine.
        state: &'static str,
    },

    /// A stop was requested with no session in progress.
    #[error("No charging session in progress")]
    NoActiveSession,

    /// The card reader failed.
    #[error("Reader error: {0}")]
    Reader(String),

    /// The power meter failed.
    #[error("Meter error: {0}")]
    Meter(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a relay fault for the given operation.
    pub fn relay(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::RelayFault {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a ledger write failure.
    pub fn ledger_write(token_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LedgerWriteFailed {
            token_id: token_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error is an expected, user-facing outcome rather than a fault.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::UnknownIdentity(_)
                | Self::InsufficientBalance { .. }
                | Self::ConcurrentSessionConflict { .. }
                | Self::NoActiveSession
        )
    }

    /// Whether repeating the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LedgerWriteFailed { .. }
                | Self::LedgerUnavailable(_)
                | Self::Timeout { .. }
                | Self::Reader(_)
                | Self::Meter(_)
                | Self::RelayFault { .. }
        )
    }
}

/// Result type alias using kiosk-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
