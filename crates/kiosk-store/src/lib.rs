//! Local persistence for the pay-before-charge kiosk.
//!
//! This crate provides SQLite-based storage for two things:
//!
//! - the account ledger, when the kiosk runs standalone and keeps balances
//!   on the device instead of in a remote ledger service;
//! - the log of finished charging sessions, for reporting and
//!   reconciliation of settlements that never reached the ledger.
//!
//! # Example
//!
//! ```no_run
//! use kiosk_store::{SessionQuery, Store};
//!
//! let store = Store::open_default()?;
//!
//! for account in store.list_accounts()? {
//!     println!("{} {:.2}", account.token_id, account.balance);
//! }
//!
//! let recent = store.query_sessions(&SessionQuery::new().token("RFID001").limit(10))?;
//! println!("{} sessions", recent.len());
//! # Ok::<(), kiosk_store::Error>(())
//! ```

mod error;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use queries::SessionQuery;
pub use store::{SessionStats, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/kiosk/ledger.db`
/// - macOS: `~/Library/Application Support/kiosk/ledger.db`
/// - Windows: `C:\Users\<user>\AppData\Local\kiosk\ledger.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("kiosk")
        .join("ledger.db")
}
