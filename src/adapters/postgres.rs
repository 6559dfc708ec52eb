// src/adapters/postgres.rs
use crate::{
    Balance, EntryType, IsolationLevel, LedgerEntry, Result, UserId, WalletError,
    adapters::{BalanceStore, IdempotencyStore, LedgerStore, TransactionalStore, UnitOfWork},
    idempotency::{ClaimOutcome, IdempotencyRecord, RETRYABLE_STATUS, StoredResponse},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    PgPool, Postgres, Row,
    postgres::{PgPoolOptions, PgRow},
};
use std::time::Duration;
use tracing::warn;

/// PostgreSQL adapter. Balance mutations lock their row with
/// `SELECT ... FOR UPDATE` inside a transaction at the requested isolation.
///
/// Schema:
/// ```sql
/// CREATE TABLE ledger_entries (
///     id UUID PRIMARY KEY,
///     user_id UUID NOT NULL,
///     amount NUMERIC(20, 2) NOT NULL CHECK (amount > 0),
///     type TEXT NOT NULL CHECK (type IN ('CREDIT', 'DEBIT')),
///     created_at TIMESTAMPTZ NOT NULL
/// );
/// CREATE INDEX idx_ledger_entries_user_created ON ledger_entries(user_id, created_at DESC, id DESC);
///
/// CREATE TABLE ledger_balances (
///     user_id UUID PRIMARY KEY,
///     amount NUMERIC(20, 2) NOT NULL,
///     version BIGINT NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
///
/// CREATE TABLE ledger_idempotency_records (
///     key TEXT PRIMARY KEY,
///     user_id UUID NOT NULL,
///     request_path TEXT NOT NULL,
///     request_body JSONB NOT NULL,
///     request_fingerprint TEXT NOT NULL,
///     response_status INTEGER,
///     response_body JSONB,
///     created_at TIMESTAMPTZ NOT NULL,
///     expires_at TIMESTAMPTZ NOT NULL
/// );
/// CREATE INDEX idx_ledger_idempotency_expires ON ledger_idempotency_records(expires_at);
/// ```
#[derive(Clone)]
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                amount NUMERIC(20, 2) NOT NULL CHECK (amount > 0),
                type TEXT NOT NULL CHECK (type IN ('CREDIT', 'DEBIT')),
                created_at TIMESTAMPTZ NOT NULL
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
                user_id UUID PRIMARY KEY,
                amount NUMERIC(20, 2) NOT NULL,
                version BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_idempotency_records (
                key TEXT PRIMARY KEY,
                user_id UUID NOT NULL,
                request_path TEXT NOT NULL,
                request_body JSONB NOT NULL,
                request_fingerprint TEXT NOT NULL,
                response_status INTEGER,
                response_body JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
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

fn balance_from_row(row: &PgRow) -> Result<Balance> {
    Ok(Balance {
        user_id: UserId::new(row.try_get("user_id")?)?,
        amount: row.try_get("amount")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: UserId::new(row.try_get("user_id")?)?,
        amount: row.try_get("amount")?,
        entry_type: row.try_get::<String, _>("type")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord> {
    let response_status = row
        .try_get::<Option<i32>, _>("response_status")?
        .map(|status| {
            u16::try_from(status)
                .map_err(|_| WalletError::Storage(format!("invalid response status {}", status)))
        })
        .transpose()?;

    Ok(IdempotencyRecord {
        key: row.try_get("key")?,
        user_id: UserId::new(row.try_get("user_id")?)?,
        request_path: row.try_get("request_path")?,
        request_body: row.try_get("request_body")?,
        request_fingerprint: row.try_get("request_fingerprint")?,
        response_status,
        response_body: row.try_get("response_body")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

struct PostgresUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
    isolation: IsolationLevel,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn ensure_balance(&mut self, user_id: UserId) -> Result<Balance> {
        // Racing inserts wait on the primary key; the loser reads the winner's row.
        sqlx::query(
            r#"
            INSERT INTO ledger_balances (user_id, amount, version, updated_at)
            VALUES ($1, 0, 1, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id.as_uuid())
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT user_id, amount, version, updated_at
            FROM ledger_balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))?;

        balance_from_row(&row)
    }

    async fn read_balance_for_update(&mut self, user_id: UserId) -> Result<Balance> {
        let row = sqlx::query(
            r#"
            SELECT user_id, amount, version, updated_at
            FROM ledger_balances
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))?;

        balance_from_row(&row)
    }

    async fn apply_delta(&mut self, user_id: UserId, delta: Decimal) -> Result<Balance> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_balances
            SET amount = amount + $2, version = version + 1, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, amount, version, updated_at
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))?;

        balance_from_row(&row)
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, user_id, amount, type, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id.as_uuid())
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PostgresAdapter {
    async fn begin(
        &self,
        isolation: IsolationLevel,
        lock_timeout: Duration,
    ) -> Result<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await?;

        // Must be the first statement of the transaction.
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            lock_timeout.as_millis().max(1)
        ))
        .execute(&mut *tx)
        .await?;

        Ok(Box::new(PostgresUnitOfWork { tx, isolation }))
    }
}

#[async_trait]
impl LedgerStore for PostgresAdapter {
    async fn list_entries(
        &self,
        user_id: UserId,
        entry_type: Option<EntryType>,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount, type, created_at
            FROM ledger_entries
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR type = $2)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(entry_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl BalanceStore for PostgresAdapter {
    async fn ensure_balance(&self, user_id: UserId) -> Result<Balance> {
        sqlx::query(
            r#"
            INSERT INTO ledger_balances (user_id, amount, version, updated_at)
            VALUES ($1, 0, 1, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id.as_uuid())
        .execute(&self.pool)
        .await?;

        self.read_balance(user_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))
    }

    async fn read_balance(&self, user_id: UserId) -> Result<Option<Balance>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, amount, version, updated_at
            FROM ledger_balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(balance_from_row).transpose()
    }
}

#[async_trait]
impl IdempotencyStore for PostgresAdapter {
    async fn claim(&self, record: &IdempotencyRecord) -> Result<ClaimOutcome> {
        // A live row makes the WHERE false and nothing is returned.
        let claimed = sqlx::query(
            r#"
            INSERT INTO ledger_idempotency_records
                (key, user_id, request_path, request_body, request_fingerprint,
                 response_status, response_body, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6, $7)
            ON CONFLICT (key) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                request_path = EXCLUDED.request_path,
                request_body = EXCLUDED.request_body,
                request_fingerprint = EXCLUDED.request_fingerprint,
                response_status = NULL,
                response_body = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE ledger_idempotency_records.expires_at <= EXCLUDED.created_at
               OR (ledger_idempotency_records.response_status = $8
                   AND ledger_idempotency_records.request_fingerprint = EXCLUDED.request_fingerprint)
            RETURNING key
            "#,
        )
        .bind(&record.key)
        .bind(record.user_id.as_uuid())
        .bind(&record.request_path)
        .bind(&record.request_body)
        .bind(&record.request_fingerprint)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(i32::from(RETRYABLE_STATUS))
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
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(now)
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
            SET response_status = $2, response_body = $3
            WHERE key = $1 AND response_status IS NULL AND expires_at > $4
            "#,
        )
        .bind(key)
        .bind(i32::from(response.status))
        .bind(&response.body)
        .bind(now)
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
        let result = sqlx::query(
            r#"
            DELETE FROM ledger_idempotency_records
            WHERE expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
