// src/adapters/sqlite.rs
use crate::{
    Balance, EntryType, IsolationLevel, LedgerEntry, Result, UserId, WalletError,
    adapters::{BalanceStore, IdempotencyStore, LedgerStore, TransactionalStore, UnitOfWork},
    idempotency::{ClaimOutcome, IdempotencyRecord, RETRYABLE_STATUS, StoredResponse},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    Row, Sqlite, SqliteConnection,
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// SQLite adapter. SQLite has no row locks, so every unit of work starts
/// with `BEGIN IMMEDIATE` and writers are serialised database-wide, which
/// satisfies any requested isolation level.
///
/// Amounts are stored as canonical decimal text and timestamps as integer
/// microseconds since the epoch so that they compare numerically.
#[derive(Clone)]
pub struct SqliteAdapter {
    pub(crate) pool: SqlitePool,
}

impl SqliteAdapter {
    /// Create a new SQLite adapter with a file-based database
    pub async fn new_file(path: &str, max_connections: u32, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .busy_timeout(busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create a new SQLite adapter with an in-memory database.
    ///
    /// The database lives in its single connection, so the pool never
    /// recycles it and every caller queues for that connection.
    pub async fn new_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id BLOB PRIMARY KEY,
                user_id BLOB NOT NULL,
                amount TEXT NOT NULL,
                type TEXT NOT NULL CHECK (type IN ('CREDIT', 'DEBIT')),
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_user_created
            ON ledger_entries(user_id, created_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_balances (
                user_id BLOB PRIMARY KEY,
                amount TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_idempotency_records (
                key TEXT PRIMARY KEY,
                user_id BLOB NOT NULL,
                request_path TEXT NOT NULL,
                request_body TEXT NOT NULL,
                request_fingerprint TEXT NOT NULL,
                response_status INTEGER,
                response_body TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_idempotency_expires
            ON ledger_idempotency_records(expires_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| WalletError::Storage(format!("timestamp out of range: {}", micros)))
}

fn decimal(text: &str) -> Result<Decimal> {
    Decimal::from_str(text)
        .map_err(|e| WalletError::Storage(format!("invalid stored amount {:?}: {}", text, e)))
}

fn balance_from_row(row: &SqliteRow) -> Result<Balance> {
    Ok(Balance {
        user_id: UserId::new(row.try_get("user_id")?)?,
        amount: decimal(row.try_get("amount")?)?,
        version: row.try_get("version")?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: UserId::new(row.try_get("user_id")?)?,
        amount: decimal(row.try_get("amount")?)?,
        entry_type: row.try_get::<String, _>("type")?.parse()?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<IdempotencyRecord> {
    let response_status = row
        .try_get::<Option<i64>, _>("response_status")?
        .map(|status| {
            u16::try_from(status)
                .map_err(|_| WalletError::Storage(format!("invalid response status {}", status)))
        })
        .transpose()?;
    let response_body = row
        .try_get::<Option<String>, _>("response_body")?
        .map(|body| serde_json::from_str(&body))
        .transpose()?;

    Ok(IdempotencyRecord {
        key: row.try_get("key")?,
        user_id: UserId::new(row.try_get("user_id")?)?,
        request_path: row.try_get("request_path")?,
        request_body: serde_json::from_str(row.try_get("request_body")?)?,
        request_fingerprint: row.try_get("request_fingerprint")?,
        response_status,
        response_body,
        created_at: from_micros(row.try_get("created_at")?)?,
        expires_at: from_micros(row.try_get("expires_at")?)?,
    })
}

async fn select_balance(conn: &mut SqliteConnection, user_id: UserId) -> Result<Option<Balance>> {
    let row = sqlx::query(
        r#"
        SELECT user_id, amount, version, updated_at
        FROM ledger_balances
        WHERE user_id = ?
        "#,
    )
    .bind(user_id.as_uuid())
    .fetch_optional(conn)
    .await?;

    row.as_ref().map(balance_from_row).transpose()
}

async fn insert_zero_balance(conn: &mut SqliteConnection, user_id: UserId) -> Result<()> {
    let zero = Decimal::new(0, crate::entry::AMOUNT_SCALE);
    sqlx::query(
        r#"
        INSERT INTO ledger_balances (user_id, amount, version, updated_at)
        VALUES (?, ?, 1, ?)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id.as_uuid())
    .bind(zero.to_string())
    .bind(to_micros(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

struct SqliteUnitOfWork {
    conn: Option<PoolConnection<Sqlite>>,
    isolation: IsolationLevel,
}

impl SqliteUnitOfWork {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| WalletError::Storage("unit of work already finished".to_string()))
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        sqlx::query(statement).execute(self.conn()?).await?;
        self.conn = None;
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork {
    fn drop(&mut self) {
        // Dropped mid-flight (e.g. the caller was cancelled): roll back before
        // the connection goes back to the pool, or discard it.
        if let Some(mut conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
                            conn.close_on_drop();
                        }
                    });
                }
                Err(_) => conn.close_on_drop(),
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn ensure_balance(&mut self, user_id: UserId) -> Result<Balance> {
        let conn = self.conn()?;
        insert_zero_balance(&mut *conn, user_id).await?;
        select_balance(conn, user_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))
    }

    async fn read_balance_for_update(&mut self, user_id: UserId) -> Result<Balance> {
        // The IMMEDIATE write lock already excludes other writers.
        select_balance(self.conn()?, user_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))
    }

    async fn apply_delta(&mut self, user_id: UserId, delta: Decimal) -> Result<Balance> {
        let conn = self.conn()?;
        let mut balance = select_balance(&mut *conn, user_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))?;
        balance.apply(delta);

        sqlx::query(
            r#"
            UPDATE ledger_balances
            SET amount = ?, version = ?, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(balance.amount.to_string())
        .bind(balance.version)
        .bind(to_micros(balance.updated_at))
        .bind(user_id.as_uuid())
        .execute(conn)
        .await?;

        Ok(balance)
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, user_id, amount, type, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id.as_uuid())
        .bind(entry.amount.to_string())
        .bind(entry.entry_type.as_str())
        .bind(to_micros(entry.created_at))
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

#[async_trait]
impl TransactionalStore for SqliteAdapter {
    async fn begin(
        &self,
        isolation: IsolationLevel,
        lock_timeout: Duration,
    ) -> Result<Box<dyn UnitOfWork>> {
        let mut conn = tokio::time::timeout(lock_timeout, self.pool.acquire())
            .await
            .map_err(|_| WalletError::LockTimeout("no free sqlite connection".to_string()))??;

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        Ok(Box::new(SqliteUnitOfWork {
            conn: Some(conn),
            isolation,
        }))
    }
}

#[async_trait]
impl LedgerStore for SqliteAdapter {
    async fn list_entries(
        &self,
        user_id: UserId,
        entry_type: Option<EntryType>,
    ) -> Result<Vec<LedgerEntry>> {
        let entry_type = entry_type.map(|t| t.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount, type, created_at
            FROM ledger_entries
            WHERE user_id = ? AND (? IS NULL OR type = ?)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(entry_type)
        .bind(entry_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl BalanceStore for SqliteAdapter {
    async fn ensure_balance(&self, user_id: UserId) -> Result<Balance> {
        let mut conn = self.pool.acquire().await?;
        insert_zero_balance(&mut conn, user_id).await?;
        select_balance(&mut conn, user_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))
    }

    async fn read_balance(&self, user_id: UserId) -> Result<Option<Balance>> {
        let mut conn = self.pool.acquire().await?;
        select_balance(&mut conn, user_id).await
    }
}

#[async_trait]
impl IdempotencyStore for SqliteAdapter {
    async fn claim(&self, record: &IdempotencyRecord) -> Result<ClaimOutcome> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO ledger_idempotency_records
                (key, user_id, request_path, request_body, request_fingerprint,
                 response_status, response_body, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                user_id = excluded.user_id,
                request_path = excluded.request_path,
                request_body = excluded.request_body,
                request_fingerprint = excluded.request_fingerprint,
                response_status = NULL,
                response_body = NULL,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            WHERE ledger_idempotency_records.expires_at <= excluded.created_at
               OR (ledger_idempotency_records.response_status = ?
                   AND ledger_idempotency_records.request_fingerprint = excluded.request_fingerprint)
            RETURNING key
            "#,
        )
        .bind(&record.key)
        .bind(record.user_id.as_uuid())
        .bind(&record.request_path)
        .bind(record.request_body.to_string())
        .bind(&record.request_fingerprint)
        .bind(to_micros(record.created_at))
        .bind(to_micros(record.expires_at))
        .bind(i64::from(RETRYABLE_STATUS))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match claimed {
            Some(_) => ClaimOutcome::Claimed,
            None => ClaimOutcome::Taken,
        })
    }

    async fn find_live(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT key, user_id, request_path, request_body, request_fingerprint,
                   response_status, response_body, created_at, expires_at
            FROM ledger_idempotency_records
            WHERE key = ? AND expires_at > ?
            "#,
        )
        .bind(key)
        .bind(to_micros(now))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn complete(
        &self,
        key: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_idempotency_records
            SET response_status = ?, response_body = ?
            WHERE key = ? AND response_status IS NULL AND expires_at > ?
            "#,
        )
        .bind(i64::from(response.status))
        .bind(response.body.to_string())
        .bind(key)
        .bind(to_micros(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(key, "no pending idempotency record to complete");
            return Err(WalletError::NotFound(format!(
                "pending idempotency record {:?}",
                key
            )));
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ledger_idempotency_records WHERE expires_at <= ?")
            .bind(to_micros(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
