//! On-disk behaviour of the store.

use kiosk_store::{SessionQuery, Store};
use kiosk_types::UserAccount;
use tempfile::TempDir;

#[test]
fn test_balances_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");

    {
        let store = Store::open(&path).unwrap();
        store
            .insert_account(&UserAccount::new("RFID001", "Asha").with_balance(80.0))
            .unwrap();
        store.set_balance("RFID001", 40.0).unwrap();
    }

    let store = Store::open(&path).unwrap();
    let account = store.get_account("RFID001").unwrap().unwrap();
    assert_eq!(account.balance, 40.0);
    assert!(store.query_sessions(&SessionQuery::new()).unwrap().is_empty());
}

#[test]
fn test_open_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("kiosk").join("ledger.db");

    let store = Store::open(&path).unwrap();
    assert_eq!(store.count_accounts().unwrap(), 0);
    assert!(path.exists());
}

#[tokio::test]
async fn test_store_moves_between_tasks() {
    let store = Store::open_in_memory().unwrap();
    let handle = tokio::task::spawn_blocking(move || {
        store
            .insert_account(&UserAccount::new("RFID002", "Ravi").with_balance(5.0))
            .unwrap();
        store
    });
    let store = handle.await.unwrap();
    assert_eq!(store.count_accounts().unwrap(), 1);
}
