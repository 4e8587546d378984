//! Schema migrations, tracked in SQLite's `user_version` pragma.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Migrations in order; entry `n` moves the database from version `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[
    // 1: accounts and the session log
    r#"
    -- The card token is the account key
    CREATE TABLE accounts (
        token_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        contact TEXT,
        balance REAL NOT NULL CHECK (balance >= 0),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    -- Finished charging sessions. Rows are rewritten when the
    -- settlement state of a session changes.
    CREATE TABLE sessions (
        id TEXT PRIMARY KEY,
        token_id TEXT NOT NULL,
        user_name TEXT NOT NULL,
        paid_amount REAL NOT NULL,
        start_battery REAL NOT NULL,
        target_battery REAL NOT NULL,
        end_battery REAL NOT NULL,
        energy_delivered_wh REAL NOT NULL,
        voltage REAL NOT NULL,
        current REAL NOT NULL,
        power_w REAL NOT NULL,
        credit_remaining REAL NOT NULL,
        remaining_balance REAL NOT NULL,
        status TEXT NOT NULL,
        stop_reason TEXT,
        ledger_sync TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        ended_at INTEGER
    );
    CREATE INDEX idx_sessions_token_time ON sessions(token_id, started_at);
    CREATE INDEX idx_sessions_sync ON sessions(ledger_sync);
    "#,
];

/// Schema version this crate writes.
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

fn user_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the database up to [`SCHEMA_VERSION`]. Each step runs in its own
/// transaction together with the version bump.
pub fn initialize(conn: &Connection) -> Result<()> {
    let found = user_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    for (version, sql) in MIGRATIONS.iter().enumerate().skip(found.max(0) as usize) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version as i32 + 1)?;
        tx.commit()?;
        tracing::debug!("Migrated database schema to version {}", version + 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_fresh_database_gets_both_tables() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(user_version(&conn).unwrap(), 0);

        initialize(&conn).unwrap();
        assert_eq!(tables(&conn), vec!["accounts", "sessions"]);
        assert_eq!(user_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_initialize_twice_is_harmless() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(user_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_database_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            initialize(&conn),
            Err(Error::UnsupportedSchema { found, .. }) if found == SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn test_negative_balance_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO accounts (token_id, name, balance, created_at, updated_at)
             VALUES ('A', 'a', -1.0, 0, 0)",
            [],
        );
        assert!(result.is_err());
    }
}
