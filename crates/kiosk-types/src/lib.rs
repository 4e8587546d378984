//! Platform-agnostic types for the pay-before-charge EV kiosk.
//!
//! This crate provides the shared data model used by the kiosk core
//! (`kiosk-core`), the local ledger store (`kiosk-store`) and the HTTP
//! service (`kiosk-service`).
//!
//! # Features
//!
//! - User accounts keyed by the RFID identity token
//! - Charging sessions with live metering figures and settlement state
//! - Identity events and the `{type, timestamp, payload}` event envelope
//! - Operator alerts
//!
//! # Example
//!
//! ```
//! use kiosk_types::{IdentityEvent, IdentityOutcome, UserAccount};
//!
//! let account = UserAccount::new("RFID001", "Asha").with_balance(80.0);
//! let event = IdentityEvent::resolve("RFID001", Some(account));
//! assert_eq!(event.outcome, IdentityOutcome::Accepted);
//! ```

pub mod error;
pub mod events;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use events::{AlertKind, IdentityEvent, IdentityOutcome, KioskEvent, OperatorAlert};
pub use types::{ChargingSession, LedgerSync, SessionStatus, StopReason, UserAccount};
