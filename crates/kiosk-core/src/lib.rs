//! Authorization and metering core for a pay-before-charge EV kiosk.
//!
//! A user presents an RFID card, pays against a stored balance, and the
//! charging circuit is powered until the paid-for battery level is reached,
//! the credit is used up, or the user cancels by presenting the card again.
//!
//! # Components
//!
//! - **Identity source**: polls the card reader and debounces raw reads into
//!   logical presentations ([`identity`])
//! - **Ledger cache**: TTL cache with write-through invalidation over the
//!   remote ledger ([`ledger`])
//! - **Session machine**: the only code that switches the relay; gates it on
//!   validated identities and settles balances ([`session`])
//! - **Metering loop**: samples the charger and tracks energy, battery and
//!   credit ([`metering`])
//! - **Event broadcaster**: fans events out to observers ([`events`])
//!
//! Hardware and the ledger are reached through the traits in [`traits`];
//! [`mock`] provides test doubles for all of them.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiosk_core::{Kiosk, KioskConfig, MemoryLedger, MockMeter, MockReader, MockRelay};
//! use kiosk_types::UserAccount;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reader = Arc::new(MockReader::new());
//!     let ledger = MemoryLedger::with_accounts([
//!         UserAccount::new("RFID001", "Asha").with_balance(80.0),
//!     ]);
//!
//!     let kiosk = Kiosk::builder()
//!         .reader(reader.clone())
//!         .relay(Arc::new(MockRelay::new()))
//!         .meter(Arc::new(MockMeter::default()))
//!         .ledger(Arc::new(ledger))
//!         .config(KioskConfig::default())
//!         .start()?;
//!
//!     let mut events = kiosk.subscribe();
//!     reader.tap("RFID001").await;
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event.event_type());
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod metering;
pub mod mock;
pub mod pricing;
#[cfg(feature = "remote-ledger")]
pub mod remote;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod traits;

pub use error::{Error, Result};
pub use events::{EventBroadcaster, EventReceiver, EventSender, Subscription};
pub use identity::{Debouncer, IdentitySource, ReaderConfig};
pub use ledger::{CacheConfig, CacheStatus, LedgerCache};
pub use metering::{MeterConfig, MeterSignal, MeteringLoop};
pub use mock::{MemoryLedger, MockMeter, MockReader, MockRelay};
pub use pricing::{ChargeQuote, Pricing, RatioPricing};
#[cfg(feature = "remote-ledger")]
pub use remote::HttpLedgerStore;
pub use retry::{RetryConfig, with_retry};
pub use runtime::{Kiosk, KioskBuilder, KioskConfig};
pub use session::{MachineState, SessionConfig, SessionMachine, SessionSnapshot, Transition};
pub use traits::{CardReader, LedgerStore, PowerMeter, PowerSample, Relay};

// Re-export the data model
pub use kiosk_types::{
    AlertKind, ChargingSession, IdentityEvent, IdentityOutcome, KioskEvent, LedgerSync,
    OperatorAlert, SessionStatus, StopReason, UserAccount,
};
