//! The local SQLite database as a ledger store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use kiosk_core::{Error, LedgerStore, Result};
use kiosk_store::Store;
use kiosk_types::UserAccount;

/// [`LedgerStore`] over the accounts table of a [`Store`].
///
/// The store is shared with the HTTP handlers and the session recorder, so
/// every call takes the store lock for the duration of one statement.
#[derive(Clone)]
pub struct SqliteLedger {
    store: Arc<Mutex<Store>>,
}

impl SqliteLedger {
    /// Wrap a shared store.
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn list_accounts(&self) -> Result<Vec<UserAccount>> {
        let store = self.store.lock().await;
        store
            .list_accounts()
            .map_err(|e| Error::LedgerUnavailable(e.to_string()))
    }

    async fn write_balance(&self, token_id: &str, balance: f64) -> Result<()> {
        let store = self.store.lock().await;
        match store.set_balance(token_id, balance) {
            Ok(()) => Ok(()),
            Err(kiosk_store::Error::AccountNotFound(token)) => Err(Error::UnknownIdentity(token)),
            Err(e) => Err(Error::ledger_write(token_id, e.to_string())),
        }
    }

    async fn append_account(
        &self,
        token_id: &str,
        name: &str,
        contact: Option<&str>,
        balance: f64,
    ) -> Result<()> {
        let mut account = UserAccount::new(token_id, name).with_balance(balance);
        account.contact = contact.map(str::to_string);

        let store = self.store.lock().await;
        let inserted = store
            .insert_account(&account)
            .map_err(|e| Error::ledger_write(token_id, e.to_string()))?;
        if inserted {
            info!("Added account {} to local ledger", token_id);
        } else {
            debug!("Account {} already in local ledger", token_id);
        }
        Ok(())
    }
}

/// Insert the given accounts unless they already exist.
///
/// Existing balances are never overwritten, so restarting the service keeps
/// what users have spent.
pub fn seed_accounts(store: &Store, accounts: &[UserAccount]) -> kiosk_store::Result<usize> {
    let mut inserted = 0;
    for account in accounts {
        if store.insert_account(account)? {
            inserted += 1;
        }
    }
    if inserted > 0 {
        info!("Seeded {} account(s)", inserted);
    }
    Ok(inserted)
}
