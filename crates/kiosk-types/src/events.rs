//! Identity and session events pushed to observers.
//!
//! Every event goes out as an envelope of the form
//! `{"type": ..., "timestamp": ..., "payload": {...}}`.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{ChargingSession, UserAccount};

/// How an identity presentation was resolved against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum IdentityOutcome {
    /// Known token with a positive balance.
    Accepted,
    /// Token not present in the ledger.
    RejectedUnknown,
    /// Known token whose balance is zero.
    RejectedInsufficientBalance,
}

impl IdentityOutcome {
    /// Whether the outcome is an acceptance.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// One logical card presentation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IdentityEvent {
    /// Token read from the card.
    pub token_id: String,
    /// When the presentation was registered.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub at: OffsetDateTime,
    /// Resolution outcome.
    pub outcome: IdentityOutcome,
    /// The resolved account, when the token is known.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub user: Option<UserAccount>,
}

impl IdentityEvent {
    /// An accepted presentation for a funded account.
    pub fn accepted(user: UserAccount) -> Self {
        Self {
            token_id: user.token_id.clone(),
            at: OffsetDateTime::now_utc(),
            outcome: IdentityOutcome::Accepted,
            user: Some(user),
        }
    }

    /// A presentation of a token the ledger does not know.
    pub fn rejected_unknown(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            at: OffsetDateTime::now_utc(),
            outcome: IdentityOutcome::RejectedUnknown,
            user: None,
        }
    }

    /// A presentation of a known but unfunded account.
    pub fn rejected_insufficient(user: UserAccount) -> Self {
        Self {
            token_id: user.token_id.clone(),
            at: OffsetDateTime::now_utc(),
            outcome: IdentityOutcome::RejectedInsufficientBalance,
            user: Some(user),
        }
    }

    /// Resolve a token against an optional account.
    pub fn resolve(token_id: &str, account: Option<UserAccount>) -> Self {
        match account {
            None => Self::rejected_unknown(token_id),
            Some(user) if user.is_funded() => Self::accepted(user),
            Some(user) => Self::rejected_insufficient(user),
        }
    }

    /// The accepted account, if any.
    pub fn accepted_user(&self) -> Option<&UserAccount> {
        if self.outcome.is_accepted() {
            self.user.as_ref()
        } else {
            None
        }
    }
}

/// Category of an operator-visible problem.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new kinds
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum AlertKind {
    /// The relay did not respond to enable or disable.
    RelayFault,
    /// A settlement write to the ledger failed and is being retried.
    LedgerWriteFailed,
    /// A refund after an aborted start could not be written.
    RefundFailed,
    /// Settlement retries are exhausted; balance needs manual repair.
    ReconciliationRequired,
}

/// A problem an operator has to look at.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OperatorAlert {
    /// Alert category.
    pub kind: AlertKind,
    /// Human-readable description.
    pub message: String,
    /// Session the alert relates to.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub session_id: Option<Uuid>,
    /// Account the alert relates to.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub token_id: Option<String>,
    /// When the alert was raised.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub raised_at: OffsetDateTime,
}

impl OperatorAlert {
    /// Create a new alert raised now.
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session_id: None,
            token_id: None,
            raised_at: OffsetDateTime::now_utc(),
        }
    }

    /// Attach the session the alert is about.
    #[must_use]
    pub fn for_session(mut self, session: &ChargingSession) -> Self {
        self.session_id = Some(session.id);
        self.token_id = Some(session.token_id.clone());
        self
    }

    /// Attach the account the alert is about.
    #[must_use]
    pub fn for_token(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }
}

/// Events delivered to observers.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
#[non_exhaustive]
pub enum KioskEvent {
    /// A card was presented.
    #[cfg_attr(feature = "serde", serde(rename = "identity_event"))]
    Identity {
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        timestamp: OffsetDateTime,
        payload: IdentityEvent,
    },
    /// The relay was engaged for a new session.
    SessionStarted {
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        timestamp: OffsetDateTime,
        payload: ChargingSession,
    },
    /// A metering tick advanced the active session.
    SessionUpdated {
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        timestamp: OffsetDateTime,
        payload: ChargingSession,
    },
    /// A session ended and the relay was opened. Sent once per session.
    SessionEnded {
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        timestamp: OffsetDateTime,
        payload: ChargingSession,
    },
    /// The ledger sync state of a finished session changed after it ended.
    SessionSettled {
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        timestamp: OffsetDateTime,
        payload: ChargingSession,
    },
    /// Something needs operator attention.
    OperatorAlert {
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        timestamp: OffsetDateTime,
        payload: OperatorAlert,
    },
}

impl KioskEvent {
    /// Wrap an identity event.
    pub fn identity(event: IdentityEvent) -> Self {
        Self::Identity {
            timestamp: OffsetDateTime::now_utc(),
            payload: event,
        }
    }

    /// Announce a started session.
    pub fn session_started(session: ChargingSession) -> Self {
        Self::SessionStarted {
            timestamp: OffsetDateTime::now_utc(),
            payload: session,
        }
    }

    /// Announce a metering update.
    pub fn session_updated(session: ChargingSession) -> Self {
        Self::SessionUpdated {
            timestamp: OffsetDateTime::now_utc(),
            payload: session,
        }
    }

    /// Announce a settled session.
    pub fn session_ended(session: ChargingSession) -> Self {
        Self::SessionEnded {
            timestamp: OffsetDateTime::now_utc(),
            payload: session,
        }
    }

    /// Announce a late change of a finished session's ledger sync state.
    pub fn session_settled(session: ChargingSession) -> Self {
        Self::SessionSettled {
            timestamp: OffsetDateTime::now_utc(),
            payload: session,
        }
    }

    /// Announce an operator alert.
    pub fn alert(alert: OperatorAlert) -> Self {
        Self::OperatorAlert {
            timestamp: OffsetDateTime::now_utc(),
            payload: alert,
        }
    }

    /// The wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "identity_event",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionUpdated { .. } => "session_updated",
            Self::SessionEnded { .. } => "session_ended",
            Self::SessionSettled { .. } => "session_settled",
            Self::OperatorAlert { .. } => "operator_alert",
        }
    }

    /// When the event was emitted.
    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            Self::Identity { timestamp, .. }
            | Self::SessionStarted { timestamp, .. }
            | Self::SessionUpdated { timestamp, .. }
            | Self::SessionEnded { timestamp, .. }
            | Self::SessionSettled { timestamp, .. }
            | Self::OperatorAlert { timestamp, .. } => *timestamp,
        }
    }

    /// The session carried by a session event.
    pub fn session(&self) -> Option<&ChargingSession> {
        match self {
            Self::SessionStarted { payload, .. }
            | Self::SessionUpdated { payload, .. }
            | Self::SessionEnded { payload, .. }
            | Self::SessionSettled { payload, .. } => Some(payload),
            _ => None,
        }
    }
}
