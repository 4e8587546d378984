//! Main store implementation.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use kiosk_types::{ChargingSession, StopReason, UserAccount};

use crate::error::{Error, Result};
use crate::queries::SessionQuery;
use crate::schema;

/// Column list shared by every session SELECT, in [`session_from_row`] order.
pub(crate) const SESSION_COLUMNS: &str = "id, token_id, user_name, paid_amount, start_battery, \
     target_battery, end_battery, energy_delivered_wh, voltage, current, power_w, \
     credit_remaining, remaining_balance, status, stop_reason, ledger_sync, started_at, ended_at";

const ACCOUNT_COLUMNS: &str = "token_id, name, contact, balance, created_at";

/// SQLite-based store for accounts and finished sessions.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// Account operations
impl Store {
    /// List all accounts, ordered by token.
    pub fn list_accounts(&self) -> Result<Vec<UserAccount>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY token_id"
        ))?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    /// Get one account by token.
    pub fn get_account(&self, token_id: &str) -> Result<Option<UserAccount>> {
        let account = self
            .conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE token_id = ?"),
                [token_id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Insert an account unless the token already exists.
    ///
    /// Returns whether a row was inserted. An existing account is left as is.
    pub fn insert_account(&self, account: &UserAccount) -> Result<bool> {
        check_balance(account.balance)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO accounts (token_id, name, contact, balance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                &account.token_id,
                &account.name,
                &account.contact,
                account.balance,
                account.created_at.unix_timestamp(),
                now
            ],
        )?;
        if inserted > 0 {
            debug!("Inserted account {}", account.token_id);
        }
        Ok(inserted > 0)
    }

    /// Insert an account, or update the name, contact and balance of an
    /// existing one.
    pub fn upsert_account(&self, account: &UserAccount) -> Result<()> {
        check_balance(account.balance)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.conn.execute(
            "INSERT INTO accounts (token_id, name, contact, balance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(token_id) DO UPDATE SET
                name = ?2,
                contact = COALESCE(?3, contact),
                balance = ?4,
                updated_at = ?6",
            rusqlite::params![
                &account.token_id,
                &account.name,
                &account.contact,
                account.balance,
                account.created_at.unix_timestamp(),
                now
            ],
        )?;
        Ok(())
    }

    /// Overwrite the balance of an existing account.
    pub fn set_balance(&self, token_id: &str, balance: f64) -> Result<()> {
        check_balance(balance)?;
        let updated = self.conn.execute(
            "UPDATE accounts SET balance = ?2, updated_at = ?3 WHERE token_id = ?1",
            rusqlite::params![
                token_id,
                balance,
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;
        if updated == 0 {
            return Err(Error::AccountNotFound(token_id.to_string()));
        }
        debug!("Balance of {} set to {:.2}", token_id, balance);
        Ok(())
    }

    /// Number of accounts.
    pub fn count_accounts(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// Session log operations
impl Store {
    /// Record a session, replacing an earlier row with the same id.
    ///
    /// A session is recorded again when its settlement state changes, so
    /// the log always holds the latest state.
    pub fn record_session(&self, session: &ChargingSession) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sessions ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            rusqlite::params![
                session.id.to_string(),
                &session.token_id,
                &session.user_name,
                session.paid_amount,
                session.start_battery,
                session.target_battery,
                session.end_battery,
                session.energy_delivered_wh,
                session.voltage,
                session.current,
                session.power_w,
                session.credit_remaining,
                session.remaining_balance,
                session.status.as_str(),
                session.stop_reason.map(|r| r.as_str()),
                session.ledger_sync.as_str(),
                session.started_at.unix_timestamp(),
                session.ended_at.map(|t| t.unix_timestamp()),
            ],
        )?;
        debug!(
            "Recorded session {} ({}, {})",
            session.id, session.status, session.ledger_sync
        );
        Ok(())
    }

    /// Get a session by id.
    pub fn get_session(&self, id: Uuid) -> Result<Option<ChargingSession>> {
        let session = self
            .conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"),
                [id.to_string()],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Query sessions with filtering and pagination.
    pub fn query_sessions(&self, query: &SessionQuery) -> Result<Vec<ChargingSession>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params_ref.as_slice(), session_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    /// Count sessions, optionally for one token.
    pub fn count_sessions(&self, token_id: Option<&str>) -> Result<u64> {
        let count: i64 = match token_id {
            Some(token) => self.conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE token_id = ?",
                [token],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    /// Totals over the session log, optionally for one token.
    pub fn session_stats(&self, token_id: Option<&str>) -> Result<SessionStats> {
        let sql = "SELECT
                COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'stopped'), 0),
                COALESCE(SUM(ledger_sync IN ('unsynced', 'needs_reconciliation')), 0),
                COALESCE(SUM(paid_amount), 0.0),
                COALESCE(SUM(paid_amount - credit_remaining), 0.0),
                COALESCE(SUM(energy_delivered_wh), 0.0)
             FROM sessions
             WHERE ?1 IS NULL OR token_id = ?1";

        let stats = self.conn.query_row(sql, [token_id], |row| {
            Ok(SessionStats {
                sessions: row.get::<_, i64>(0)? as u64,
                completed: row.get::<_, i64>(1)? as u64,
                stopped: row.get::<_, i64>(2)? as u64,
                unsynced: row.get::<_, i64>(3)? as u64,
                total_paid: row.get(4)?,
                total_consumed: row.get(5)?,
                total_energy_wh: row.get(6)?,
            })
        })?;
        Ok(stats)
    }
}

/// Totals over logged sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Number of sessions.
    pub sessions: u64,
    /// Sessions that ran to completion.
    pub completed: u64,
    /// Sessions stopped early.
    pub stopped: u64,
    /// Sessions whose settlement has not reached the ledger.
    pub unsynced: u64,
    /// Sum of paid amounts.
    pub total_paid: f64,
    /// Sum of consumed credit.
    pub total_consumed: f64,
    /// Energy delivered, in watt-hours.
    pub total_energy_wh: f64,
}

fn check_balance(balance: f64) -> Result<()> {
    if balance.is_finite() && balance >= 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidValue {
            column: "balance",
            value: balance.to_string(),
        })
    }
}

fn timestamp(idx: usize, value: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<UserAccount> {
    Ok(UserAccount {
        token_id: row.get(0)?,
        name: row.get(1)?,
        contact: row.get(2)?,
        balance: row.get(3)?,
        created_at: timestamp(4, row.get(4)?)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChargingSession> {
    let stop_reason = match row.get::<_, Option<String>>(14)? {
        Some(text) => Some(text.parse::<StopReason>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(14, Type::Text, Box::new(e))
        })?),
        None => None,
    };
    let ended_at = match row.get::<_, Option<i64>>(17)? {
        Some(ts) => Some(timestamp(17, ts)?),
        None => None,
    };

    Ok(ChargingSession {
        id: parsed::<Uuid>(row, 0)?,
        token_id: row.get(1)?,
        user_name: row.get(2)?,
        paid_amount: row.get(3)?,
        start_battery: row.get(4)?,
        target_battery: row.get(5)?,
        end_battery: row.get(6)?,
        energy_delivered_wh: row.get(7)?,
        voltage: row.get(8)?,
        current: row.get(9)?,
        power_w: row.get(10)?,
        credit_remaining: row.get(11)?,
        remaining_balance: row.get(12)?,
        status: parsed(row, 13)?,
        stop_reason,
        ledger_sync: parsed(row, 15)?,
        started_at: timestamp(16, row.get(16)?)?,
        ended_at,
    })
}
