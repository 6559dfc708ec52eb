//! # wallet-ledger
//!
//! A digital-wallet ledger: every credit and debit is an immutable
//! [`LedgerEntry`], each user has one materialised [`Balance`] row, and
//! balance mutations stay correct under concurrent and retried requests.
//!
//! ## What's inside
//!
//! ### Row-locked mutations
//! [`LedgerService::create_transaction`] runs inside one unit of work:
//! ensure the balance row, lock it, check funds for debits, append the
//! entry, apply the signed delta, commit. A failed check aborts the unit of
//! work and nothing is written. Distinct users never contend.
//!
//! ### Idempotent replay
//! A client-supplied key is registered *before* the side effect runs. The
//! unique insert decides who executes; retries replay the stored
//! `{status, body}` verbatim, concurrent duplicates get a conflict.
//!
//! ```rust,ignore
//! let system = WalletSystem::new(Box::new(MemoryAdapter::new()), &WalletConfig::default());
//! let request = NewTransaction::credit(user, Decimal::new(50_00, 2))?;
//!
//! let first = system.create_transaction(request.clone(), Some("abc")).await?;
//! let retry = system.create_transaction(request, Some("abc")).await?;
//! assert_eq!(first.body, retry.body);
//! assert!(retry.replayed);
//! ```
//!
//! ## Feature flags
//!
//! | Flag       | Default | Description                          |
//! |------------|---------|--------------------------------------|
//! | `postgres` | ✓       | PostgreSQL adapter via sqlx          |
//! | `sqlite`   | ✓       | SQLite adapter (in-memory or file)   |
pub mod adapters;
pub mod balance;
pub mod config;
pub mod entry;
pub mod error;
pub mod idempotency;
pub mod service;
pub mod transaction;

pub use balance::Balance;
pub use config::WalletConfig;
pub use entry::{EntryType, LedgerEntry, NewTransaction, UserId};
pub use error::{Result, WalletError};
pub use idempotency::{
    IdempotencyCoordinator, IdempotencyRecord, IdempotentResponse, Registration, StoredResponse,
    spawn_expiry_sweeper,
};
pub use service::LedgerService;
pub use transaction::{IsolationLevel, TransactionManager, WorkFuture};

use adapters::{BalanceStore, IdempotencyStore, LedgerStore, TransactionalStore};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, instrument};

/// Path recorded on idempotency records for transaction creation.
pub const CREATE_TRANSACTION_PATH: &str = "/transactions";

/// Storage seam: everything the core needs from a backend.
pub trait LedgerAdapter:
    TransactionalStore + LedgerStore + BalanceStore + IdempotencyStore + Send + Sync
{
}

impl<T> LedgerAdapter for T where
    T: TransactionalStore + LedgerStore + BalanceStore + IdempotencyStore + Send + Sync
{
}

/// Entry point for the request layer.
pub struct WalletSystem {
    adapter: Arc<dyn LedgerAdapter>,
    ledger: LedgerService,
    idempotency: Arc<IdempotencyCoordinator>,
}

impl WalletSystem {
    pub fn new(adapter: Box<dyn LedgerAdapter>, config: &WalletConfig) -> Self {
        let adapter: Arc<dyn LedgerAdapter> = adapter.into();
        let transactions = TransactionManager::new(
            Arc::clone(&adapter),
            config.lock_timeout(),
            config.unit_of_work_timeout(),
        );

        Self {
            ledger: LedgerService::new(Arc::clone(&adapter), transactions, config.isolation_level),
            idempotency: Arc::new(IdempotencyCoordinator::new(
                Arc::clone(&adapter),
                config.idempotency_ttl(),
            )),
            adapter,
        }
    }

    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    pub fn idempotency(&self) -> Arc<IdempotencyCoordinator> {
        Arc::clone(&self.idempotency)
    }

    /// Creates a transaction, deduplicated by `idempotency_key` when given.
    ///
    /// Domain outcomes (created, validation, insufficient balance, key
    /// conflict or mismatch) come back as a structured response; storage and
    /// timeout failures come back as `Err`. A keyed transient failure is
    /// recorded as a 503 that the next retry with the same request replaces
    /// by running again.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, key = idempotency_key))]
    pub async fn create_transaction(
        &self,
        request: NewTransaction,
        idempotency_key: Option<&str>,
    ) -> Result<IdempotentResponse> {
        let request = match request.normalized() {
            Ok(request) => request,
            Err(err) => return Ok(IdempotentResponse::fresh(StoredResponse::from_error(&err))),
        };
        let Some(key) = idempotency_key else {
            let outcome = self.ledger.create_transaction(request).await;
            return Self::render(outcome).map(IdempotentResponse::fresh);
        };

        // Fingerprinted after normalisation so equal amounts match.
        let body = serde_json::to_value(&request)?;
        let registration = self
            .idempotency
            .check_and_register(key, request.user_id, CREATE_TRANSACTION_PATH, &body)
            .await;

        match registration {
            Ok(Registration::Replay(response)) => Ok(IdempotentResponse::replayed(response)),
            Ok(Registration::New) => {
                let outcome = self.ledger.create_transaction(request).await;
                let response = match &outcome {
                    Ok(entry) => StoredResponse::new(201, serde_json::to_value(entry)?),
                    Err(err) => StoredResponse::from_error(err),
                };

                if let Err(err) = self.idempotency.save_response(key, &response).await {
                    error!(key, error = %err, "failed to save idempotent response");
                }

                match outcome {
                    Err(err) if !err.is_domain() => Err(err),
                    _ => Ok(IdempotentResponse::fresh(response)),
                }
            }
            Err(err) if err.is_domain() => {
                Ok(IdempotentResponse::fresh(StoredResponse::from_error(&err)))
            }
            Err(err) => Err(err),
        }
    }

    fn render(outcome: Result<LedgerEntry>) -> Result<StoredResponse> {
        match outcome {
            Ok(entry) => Ok(StoredResponse::new(201, serde_json::to_value(&entry)?)),
            Err(err) if err.is_domain() => Ok(StoredResponse::from_error(&err)),
            Err(err) => Err(err),
        }
    }

    pub async fn list_transactions(
        &self,
        user_id: UserId,
        entry_type: Option<EntryType>,
    ) -> Result<Vec<LedgerEntry>> {
        self.ledger.list_transactions(user_id, entry_type).await
    }

    pub async fn get_balance(&self, user_id: UserId) -> Result<Decimal> {
        self.ledger.get_balance(user_id).await
    }

    /// Invoked by the periodic sweep, never from the request path.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.idempotency.cleanup_expired().await
    }
}
