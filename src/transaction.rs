// src/transaction.rs
use crate::{LedgerAdapter, Result, WalletError, adapters::UnitOfWork};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Boxed body of a unit of work, borrowing the handle for its whole run.
pub type WorkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Ok(Self::ReadCommitted),
            "repeatable_read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            other => Err(WalletError::Config(format!(
                "unknown isolation level: {}",
                other
            ))),
        }
    }
}

/// Runs bodies as one atomic unit of work on the adapter.
///
/// The body gets a [`UnitOfWork`] handle; returning `Ok` commits every write
/// made through it, returning `Err` (or overrunning the timeout) rolls all of
/// them back.
#[derive(Clone)]
pub struct TransactionManager {
    adapter: Arc<dyn LedgerAdapter>,
    lock_timeout: Duration,
    timeout: Duration,
}

impl TransactionManager {
    pub fn new(adapter: Arc<dyn LedgerAdapter>, lock_timeout: Duration, timeout: Duration) -> Self {
        Self {
            adapter,
            lock_timeout,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run<T, F>(&self, isolation: IsolationLevel, body: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut dyn UnitOfWork) -> WorkFuture<'a, T> + Send,
    {
        let started = Instant::now();
        let mut uow = self.adapter.begin(isolation, self.lock_timeout).await?;

        let outcome = match tokio::time::timeout(self.timeout, body(uow.as_mut())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(WalletError::Timeout(self.timeout)),
        };

        let result = match outcome {
            Ok(value) => uow.commit().await.map(|_| value),
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        };

        histogram!("wallet.unit_of_work.duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Balance, UserId, adapters::BalanceStore, adapters::memory::MemoryAdapter};
    use rust_decimal::Decimal;

    fn manager(adapter: Arc<MemoryAdapter>, timeout: Duration) -> TransactionManager {
        TransactionManager::new(adapter, Duration::from_millis(200), timeout)
    }

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "repeatable-read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[tokio::test]
    async fn test_error_rolls_back_all_writes() {
        let adapter = Arc::new(MemoryAdapter::new());
        let tm = manager(adapter.clone(), Duration::from_secs(1));
        let user = UserId::generate();

        let result: Result<Balance> = tm
            .run(IsolationLevel::ReadCommitted, move |uow| {
                Box::pin(async move {
                    uow.ensure_balance(user).await?;
                    uow.read_balance_for_update(user).await?;
                    uow.apply_delta(user, Decimal::new(500, 2)).await?;
                    Err(WalletError::Validation("abort".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(WalletError::Validation(_))));
        assert!(adapter.read_balance(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let adapter = Arc::new(MemoryAdapter::new());
        let tm = manager(adapter.clone(), Duration::from_secs(1));
        let user = UserId::generate();

        let balance = tm
            .run(IsolationLevel::Serializable, move |uow| {
                Box::pin(async move {
                    uow.ensure_balance(user).await?;
                    uow.read_balance_for_update(user).await?;
                    uow.apply_delta(user, Decimal::new(500, 2)).await
                })
            })
            .await
            .unwrap();

        assert_eq!(balance.version, 2);
        let stored = adapter.read_balance(user).await.unwrap().unwrap();
        assert_eq!(stored.amount, Decimal::new(500, 2));
    }

    #[tokio::test]
    async fn test_timeout_aborts_unit_of_work() {
        let adapter = Arc::new(MemoryAdapter::new());
        let tm = manager(adapter.clone(), Duration::from_millis(50));
        let user = UserId::generate();

        let result: Result<()> = tm
            .run(IsolationLevel::ReadCommitted, move |uow| {
                Box::pin(async move {
                    uow.ensure_balance(user).await?;
                    uow.read_balance_for_update(user).await?;
                    uow.apply_delta(user, Decimal::new(100, 2)).await?;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(WalletError::Timeout(_))));
        assert!(adapter.read_balance(user).await.unwrap().is_none());
    }
}
