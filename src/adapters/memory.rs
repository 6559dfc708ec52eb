// src/adapters/memory.rs
use crate::{
    Balance, EntryType, IsolationLevel, LedgerEntry, Result, UserId, WalletError,
    adapters::{BalanceStore, IdempotencyStore, LedgerStore, TransactionalStore, UnitOfWork},
    idempotency::{ClaimOutcome, IdempotencyRecord, StoredResponse},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

#[derive(Default)]
struct MemoryState {
    entries: Vec<LedgerEntry>,
    balances: HashMap<UserId, Balance>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

#[derive(Clone, Default)]
struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    row_locks: Arc<Mutex<HashMap<UserId, Arc<RowLock<()>>>>>,
}

impl MemoryStore {
    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| WalletError::Storage("memory store poisoned".to_string()))
    }

    fn row_lock(&self, user_id: UserId) -> Result<Arc<RowLock<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| WalletError::Storage("lock table poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(user_id).or_default()))
    }
}

/// In-process adapter. Balance rows are guarded by one async mutex per user,
/// writes are buffered in the unit of work and published on commit.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    store: MemoryStore,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryUnitOfWork {
    store: MemoryStore,
    isolation: IsolationLevel,
    lock_timeout: Duration,
    held: HashMap<UserId, OwnedMutexGuard<()>>,
    created: HashSet<UserId>,
    staged: HashMap<UserId, Balance>,
    entries: Vec<LedgerEntry>,
}

impl MemoryUnitOfWork {
    async fn lock(&mut self, user_id: UserId) -> Result<()> {
        if self.held.contains_key(&user_id) {
            return Ok(());
        }

        let row = self.store.row_lock(user_id)?;
        let guard = tokio::time::timeout(self.lock_timeout, row.lock_owned())
            .await
            .map_err(|_| {
                WalletError::LockTimeout(format!("balance row of {} is locked", user_id))
            })?;
        self.held.insert(user_id, guard);
        Ok(())
    }

    /// Working copy of a row this unit of work holds the lock on.
    fn locked_row(&mut self, user_id: UserId) -> Result<&mut Balance> {
        if !self.staged.contains_key(&user_id) {
            let committed = self.store.state()?.balances.get(&user_id).cloned();
            let row = match committed {
                Some(row) => row,
                None if self.created.contains(&user_id) => Balance::new(user_id),
                None => {
                    return Err(WalletError::NotFound(format!(
                        "balance row of {}",
                        user_id
                    )));
                }
            };
            self.staged.insert(user_id, row);
        }

        self.staged
            .get_mut(&user_id)
            .ok_or_else(|| WalletError::NotFound(format!("balance row of {}", user_id)))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn ensure_balance(&mut self, user_id: UserId) -> Result<Balance> {
        if let Some(row) = self.staged.get(&user_id) {
            return Ok(row.clone());
        }
        if let Some(row) = self.store.state()?.balances.get(&user_id) {
            return Ok(row.clone());
        }
        self.created.insert(user_id);
        Ok(Balance::new(user_id))
    }

    async fn read_balance_for_update(&mut self, user_id: UserId) -> Result<Balance> {
        self.lock(user_id).await?;
        Ok(self.locked_row(user_id)?.clone())
    }

    async fn apply_delta(&mut self, user_id: UserId, delta: Decimal) -> Result<Balance> {
        self.lock(user_id).await?;
        let row = self.locked_row(user_id)?;
        row.apply(delta);
        Ok(row.clone())
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        {
            let mut state = this.store.state()?;
            for user_id in &this.created {
                state
                    .balances
                    .entry(*user_id)
                    .or_insert_with(|| Balance::new(*user_id));
            }
            for (user_id, row) in this.staged {
                state.balances.insert(user_id, row);
            }
            state.entries.extend(this.entries);
        }
        // Row locks are released when `held` drops, after publication.
        drop(this.held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for MemoryAdapter {
    async fn begin(
        &self,
        isolation: IsolationLevel,
        lock_timeout: Duration,
    ) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            store: self.store.clone(),
            isolation,
            lock_timeout,
            held: HashMap::new(),
            created: HashSet::new(),
            staged: HashMap::new(),
            entries: Vec::new(),
        }))
    }
}

#[async_trait]
impl LedgerStore for MemoryAdapter {
    async fn list_entries(
        &self,
        user_id: UserId,
        entry_type: Option<EntryType>,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.store.state()?;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| entry_type.is_none_or(|t| e.entry_type == t))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }
}

#[async_trait]
impl BalanceStore for MemoryAdapter {
    async fn ensure_balance(&self, user_id: UserId) -> Result<Balance> {
        let mut state = self.store.state()?;
        Ok(state
            .balances
            .entry(user_id)
            .or_insert_with(|| Balance::new(user_id))
            .clone())
    }

    async fn read_balance(&self, user_id: UserId) -> Result<Option<Balance>> {
        Ok(self.store.state()?.balances.get(&user_id).cloned())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryAdapter {
    async fn claim(&self, record: &IdempotencyRecord) -> Result<ClaimOutcome> {
        let mut state = self.store.state()?;
        if let Some(existing) = state.idempotency.get(&record.key) {
            if !existing.is_expired(record.created_at) && !existing.is_reclaimable_by(record) {
                return Ok(ClaimOutcome::Taken);
            }
        }
        state.idempotency.insert(record.key.clone(), record.clone());
        Ok(ClaimOutcome::Claimed)
    }

    async fn find_live(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let state = self.store.state()?;
        Ok(state
            .idempotency
            .get(key)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn complete(
        &self,
        key: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.store.state()?;
        match state.idempotency.get_mut(key) {
            Some(record) if !record.is_completed() && !record.is_expired(now) => {
                record.response_status = Some(response.status);
                record.response_body = Some(response.body.clone());
                Ok(())
            }
            _ => Err(WalletError::NotFound(format!(
                "pending idempotency record {:?}",
                key
            ))),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.store.state()?;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| !record.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_row_lock_times_out_while_held() {
        let adapter = MemoryAdapter::new();
        let user = UserId::generate();
        adapter.ensure_balance(user).await.unwrap();

        let mut first = adapter
            .begin(IsolationLevel::ReadCommitted, Duration::from_millis(50))
            .await
            .unwrap();
        first.read_balance_for_update(user).await.unwrap();

        let mut second = adapter
            .begin(IsolationLevel::ReadCommitted, Duration::from_millis(50))
            .await
            .unwrap();
        let err = second.read_balance_for_update(user).await.unwrap_err();
        assert!(matches!(err, WalletError::LockTimeout(_)));

        first.rollback().await.unwrap();
        second.read_balance_for_update(user).await.unwrap();
        second.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_locks_are_per_user() {
        let adapter = MemoryAdapter::new();
        let alice = UserId::generate();
        let bob = UserId::generate();
        adapter.ensure_balance(alice).await.unwrap();
        adapter.ensure_balance(bob).await.unwrap();

        let mut first = adapter
            .begin(IsolationLevel::ReadCommitted, Duration::from_millis(50))
            .await
            .unwrap();
        first.read_balance_for_update(alice).await.unwrap();

        let mut second = adapter
            .begin(IsolationLevel::ReadCommitted, Duration::from_millis(50))
            .await
            .unwrap();
        second.read_balance_for_update(bob).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_delta_requires_row() {
        let adapter = MemoryAdapter::new();
        let mut uow = adapter
            .begin(IsolationLevel::ReadCommitted, Duration::from_millis(50))
            .await
            .unwrap();
        let err = uow
            .apply_delta(UserId::generate(), Decimal::ONE)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let adapter = MemoryAdapter::new();
        let user = UserId::generate();
        adapter.ensure_balance(user).await.unwrap();

        let mut uow = adapter
            .begin(IsolationLevel::ReadCommitted, Duration::from_millis(50))
            .await
            .unwrap();
        uow.apply_delta(user, Decimal::new(1000, 2)).await.unwrap();

        let committed = adapter.read_balance(user).await.unwrap().unwrap();
        assert_eq!(committed.amount, Decimal::ZERO);
        assert_eq!(committed.version, 1);

        uow.commit().await.unwrap();
        let committed = adapter.read_balance(user).await.unwrap().unwrap();
        assert_eq!(committed.amount, Decimal::new(1000, 2));
        assert_eq!(committed.version, 2);
    }
}
