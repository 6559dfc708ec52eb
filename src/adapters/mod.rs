pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryAdapter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;

use crate::{
    Balance, EntryType, IsolationLevel, LedgerEntry, Result, UserId,
    idempotency::{ClaimOutcome, IdempotencyRecord, StoredResponse},
};

/// -----------------------------
/// Adapter contract
/// -----------------------------

/// Handle to one open unit of work.
///
/// Every write made through the handle becomes visible at `commit` and is
/// discarded as a whole at `rollback`. Row locks taken by
/// `read_balance_for_update` are held until either happens.
#[async_trait]
pub trait UnitOfWork: Send {
    fn isolation(&self) -> IsolationLevel;

    /// Returns the user's balance row, creating it at zero if absent.
    async fn ensure_balance(&mut self, user_id: UserId) -> Result<Balance>;

    /// Locks the user's balance row for the rest of the unit of work.
    /// Fails with `NotFound` when no row exists.
    async fn read_balance_for_update(&mut self, user_id: UserId) -> Result<Balance>;

    /// Adds `delta` to the balance and bumps its version.
    /// Fails with `NotFound` when no row exists.
    async fn apply_delta(&mut self, user_id: UserId, delta: Decimal) -> Result<Balance>;

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(
        &self,
        isolation: IsolationLevel,
        lock_timeout: Duration,
    ) -> Result<Box<dyn UnitOfWork>>;
}

/// Read side of the append-only ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Committed entries of one user, newest first.
    async fn list_entries(
        &self,
        user_id: UserId,
        entry_type: Option<EntryType>,
    ) -> Result<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Concurrent calls for the same absent user yield a single row.
    async fn ensure_balance(&self, user_id: UserId) -> Result<Balance>;

    /// Unlocked read of the last committed row.
    async fn read_balance(&self, user_id: UserId) -> Result<Option<Balance>>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Inserts a pending record. A live record under the same key wins,
    /// except when it has expired without being swept, or when it holds a
    /// retryable failure of the same request (see
    /// [`IdempotencyRecord::is_reclaimable_by`]); those are taken over.
    async fn claim(&self, record: &IdempotencyRecord) -> Result<ClaimOutcome>;

    /// Record under `key` unless it expired at or before `now`.
    async fn find_live(&self, key: &str, now: DateTime<Utc>)
    -> Result<Option<IdempotencyRecord>>;

    /// Moves a pending record that is still live at `now` to completed.
    /// `NotFound` if nothing live is pending.
    async fn complete(&self, key: &str, response: &StoredResponse, now: DateTime<Utc>)
    -> Result<()>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
