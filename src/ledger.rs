//! Usage ledger - append-only record of per-request outcomes.
//!
//! Every completed attempt (success or terminal failure) produces exactly one
//! [`UsageRecord`]. The budget tracker, rate limiter and selector all read
//! aggregates from here; nothing else writes to it.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one backend attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub backend_id: String,
    /// Absent caller id means the global quota bucket.
    pub caller_id: Option<String>,
    pub tokens: u64,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Record a successful attempt.
    pub fn success(
        backend_id: impl Into<String>,
        caller_id: Option<String>,
        tokens: u64,
        latency_ms: u64,
        cost_usd: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: backend_id.into(),
            caller_id,
            tokens,
            latency_ms,
            cost_usd,
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Record a failed attempt. Failures cost nothing but still count toward
    /// quotas and performance history.
    pub fn failure(backend_id: impl Into<String>, caller_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: backend_id.into(),
            caller_id,
            tokens: 0,
            latency_ms: 0,
            cost_usd: 0.0,
            success: false,
            timestamp: Utc::now(),
        }
    }
}

/// Start of the current calendar-month period in UTC.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Ledger store, implemented by the surrounding platform.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one record. Append-only; records are never updated.
    async fn save(&self, record: &UsageRecord) -> anyhow::Result<()>;

    /// Total spend in USD for the current calendar month. A caller id scopes
    /// the aggregate; `None` aggregates over all callers.
    async fn monthly_spend(&self, caller_id: Option<&str>) -> anyhow::Result<f64>;

    /// Number of attempts recorded since `since`, scoped like
    /// [`monthly_spend`](Self::monthly_spend).
    async fn count_since(
        &self,
        caller_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Observed success ratio for a backend, or `None` with no history.
    async fn success_rate(&self, backend_id: &str) -> anyhow::Result<Option<f64>>;
}

/// SQLite-backed ledger.
///
/// Queries are small single-table aggregates, so the connection sits behind a
/// plain mutex rather than a blocking-pool handoff.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (and migrate) a ledger at the given path.
    pub fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::migrate(&conn)?;
        tracing::info!(path = %path.display(), "opened usage ledger");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory ledger, used by tests and ephemeral deployments.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_records (
                id          TEXT PRIMARY KEY,
                backend_id  TEXT NOT NULL,
                caller_id   TEXT,
                tokens      INTEGER NOT NULL,
                latency_ms  INTEGER NOT NULL,
                cost_usd    REAL NOT NULL,
                success     INTEGER NOT NULL,
                timestamp   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_caller_ts
                ON usage_records (caller_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_usage_backend
                ON usage_records (backend_id);",
        )?;
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger connection lock poisoned"))
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn save(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO usage_records
                (id, backend_id, caller_id, tokens, latency_ms, cost_usd, success, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                record.backend_id,
                record.caller_id,
                record.tokens as i64,
                record.latency_ms as i64,
                record.cost_usd,
                record.success as i64,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn monthly_spend(&self, caller_id: Option<&str>) -> anyhow::Result<f64> {
        let since = month_start(Utc::now()).to_rfc3339();
        let conn = self.lock()?;
        let spend: f64 = match caller_id {
            Some(caller) => conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records
                 WHERE caller_id = ?1 AND timestamp >= ?2",
                params![caller, since],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records
                 WHERE timestamp >= ?1",
                params![since],
                |row| row.get(0),
            )?,
        };
        Ok(spend)
    }

    async fn count_since(
        &self,
        caller_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let since = since.to_rfc3339();
        let conn = self.lock()?;
        let count: i64 = match caller_id {
            Some(caller) => conn.query_row(
                "SELECT COUNT(*) FROM usage_records
                 WHERE caller_id = ?1 AND timestamp >= ?2",
                params![caller, since],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM usage_records WHERE timestamp >= ?1",
                params![since],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    async fn success_rate(&self, backend_id: &str) -> anyhow::Result<Option<f64>> {
        let conn = self.lock()?;
        let (total, successes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM usage_records
             WHERE backend_id = ?1",
            params![backend_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total == 0 {
            Ok(None)
        } else {
            Ok(Some(successes as f64 / total as f64))
        }
    }
}
