//! Query builder for the session log.
//!
//! # Example
//!
//! ```
//! use kiosk_store::{SessionQuery, Store};
//! use kiosk_types::LedgerSync;
//!
//! let store = Store::open_in_memory()?;
//!
//! // Sessions whose settlement never reached the ledger
//! let query = SessionQuery::new().ledger_sync(LedgerSync::NeedsReconciliation);
//! let pending = store.query_sessions(&query)?;
//! assert!(pending.is_empty());
//! # Ok::<(), kiosk_store::Error>(())
//! ```

use time::OffsetDateTime;

use kiosk_types::{LedgerSync, SessionStatus};

/// Fluent query builder for logged sessions.
///
/// By default results are ordered by `started_at` descending (newest first).
#[derive(Debug, Default, Clone)]
pub struct SessionQuery {
    /// Filter by owning token.
    pub token_id: Option<String>,
    /// Filter by final status.
    pub status: Option<SessionStatus>,
    /// Filter by settlement state.
    pub ledger_sync: Option<LedgerSync>,
    /// Sessions started at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Sessions started at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by started_at descending.
    pub newest_first: bool,
}

impl SessionQuery {
    /// Create a query over all sessions, newest first.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    /// Only sessions owned by this token.
    pub fn token(mut self, token_id: &str) -> Self {
        self.token_id = Some(token_id.to_string());
        self
    }

    /// Only sessions that ended with this status.
    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only sessions in this settlement state.
    pub fn ledger_sync(mut self, sync: LedgerSync) -> Self {
        self.ledger_sync = Some(sync);
        self
    }

    /// Sessions started at or after this time.
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Sessions started at or before this time.
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first N results.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Chronological order.
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref token_id) = self.token_id {
            conditions.push("token_id = ?");
            params.push(Box::new(token_id.clone()));
        }

        if let Some(status) = self.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(sync) = self.ledger_sync {
            conditions.push("ledger_sync = ?");
            params.push(Box::new(sync.as_str()));
        }

        if let Some(since) = self.since {
            conditions.push("started_at >= ?");
            params.push(Box::new(since.unix_timestamp()));
        }

        if let Some(until) = self.until {
            conditions.push("started_at <= ?");
            params.push(Box::new(until.unix_timestamp()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT {} FROM sessions {} ORDER BY started_at {}, rowid {}",
            crate::store::SESSION_COLUMNS,
            where_clause,
            order,
            order
        );

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        } else if self.offset.is_some() {
            // SQLite needs a LIMIT before OFFSET
            sql.push_str(" LIMIT -1");
        }

        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }
}
