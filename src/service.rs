// src/service.rs
use crate::{
    Balance, EntryType, IsolationLevel, LedgerAdapter, LedgerEntry, NewTransaction, Result,
    TransactionManager, UserId, WalletError,
};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Orchestrates balance checks, ledger appends and balance updates.
pub struct LedgerService {
    adapter: Arc<dyn LedgerAdapter>,
    transactions: TransactionManager,
    isolation: IsolationLevel,
}

impl LedgerService {
    pub fn new(
        adapter: Arc<dyn LedgerAdapter>,
        transactions: TransactionManager,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            adapter,
            transactions,
            isolation,
        }
    }

    /// Appends one entry and moves the balance by its signed amount, all in
    /// one unit of work holding the user's balance row lock.
    pub async fn create_transaction(&self, request: NewTransaction) -> Result<LedgerEntry> {
        let request = request.normalized()?;
        let entry_type = request.entry_type;
        let amount = request.amount;

        let result = self
            .transactions
            .run(self.isolation, move |uow| {
                Box::pin(async move {
                    let user_id = request.user_id;
                    uow.ensure_balance(user_id).await?;
                    let balance = uow.read_balance_for_update(user_id).await?;

                    if request.entry_type == EntryType::Debit && balance.amount < request.amount {
                        return Err(WalletError::InsufficientBalance {
                            available: balance.amount,
                            requested: request.amount,
                        });
                    }

                    let entry = LedgerEntry::new(&request);
                    uow.append_entry(&entry).await?;
                    let updated = uow.apply_delta(user_id, entry.signed_amount()).await?;

                    debug!(
                        user_id = %user_id,
                        entry_id = %entry.id,
                        entry_type = %entry.entry_type,
                        balance = %updated.amount,
                        version = updated.version,
                        "ledger entry appended"
                    );
                    Ok(entry)
                })
            })
            .await;

        counter!("wallet.transactions.total",
            "status" => if result.is_ok() { "success" } else { "failed" },
            "type" => entry_type.as_str()
        )
        .increment(1);

        match &result {
            Ok(_) => {
                histogram!("wallet.transaction.amount", "type" => entry_type.as_str())
                    .record(amount.to_f64().unwrap_or_default());
            }
            Err(WalletError::NotFound(what)) => {
                error!(missing = %what, "balance row vanished inside the unit of work");
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "transaction aborted, safe to retry");
            }
            Err(_) => {}
        }

        result
    }

    /// Committed entries, newest first. Never waits on row locks.
    pub async fn list_transactions(
        &self,
        user_id: UserId,
        entry_type: Option<EntryType>,
    ) -> Result<Vec<LedgerEntry>> {
        self.adapter.list_entries(user_id, entry_type).await
    }

    /// Materialised balance, zero for users without a row yet.
    pub async fn get_balance(&self, user_id: UserId) -> Result<Decimal> {
        Ok(self
            .get_balance_snapshot(user_id)
            .await?
            .map(|balance| balance.amount)
            .unwrap_or_else(|| Decimal::new(0, crate::entry::AMOUNT_SCALE)))
    }

    pub async fn get_balance_snapshot(&self, user_id: UserId) -> Result<Option<Balance>> {
        self.adapter.read_balance(user_id).await
    }
}
