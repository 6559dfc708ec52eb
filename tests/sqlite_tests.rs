// tests/sqlite_tests.rs
#![cfg(feature = "sqlite")]

use rust_decimal::Decimal;
use std::sync::Arc;
use wallet_ledger::{
    EntryType, IdempotentResponse, NewTransaction, UserId, WalletConfig, WalletSystem,
    adapters::sqlite::SqliteAdapter,
};

async fn setup() -> (Arc<WalletSystem>, UserId) {
    let adapter = SqliteAdapter::new_memory().await.unwrap();
    adapter.init_schema().await.unwrap();

    let system = Arc::new(WalletSystem::new(Box::new(adapter), &WalletConfig::default()));
    let user = UserId::generate();

    (system, user)
}

fn usd(units: i64) -> Decimal {
    Decimal::new(units * 100, 2)
}

async fn submit(
    system: &WalletSystem,
    user: UserId,
    entry_type: EntryType,
    units: i64,
    key: Option<&str>,
) -> IdempotentResponse {
    let request = NewTransaction::new(user, usd(units), entry_type).unwrap();
    system.create_transaction(request, key).await.unwrap()
}

#[tokio::test]
async fn test_init_schema_is_idempotent() {
    let adapter = SqliteAdapter::new_memory().await.unwrap();
    adapter.init_schema().await.unwrap();
    adapter.init_schema().await.unwrap();
}

#[tokio::test]
async fn test_credit_then_debit_to_zero() {
    let (system, user) = setup().await;

    submit(&system, user, EntryType::Credit, 100, None).await;
    let debit = submit(&system, user, EntryType::Debit, 100, None).await;
    assert_eq!(debit.status, 201);

    assert_eq!(system.get_balance(user).await.unwrap(), Decimal::ZERO);
    assert_eq!(system.list_transactions(user, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_overdraft_leaves_no_trace() {
    let (system, user) = setup().await;
    submit(&system, user, EntryType::Credit, 100, None).await;

    let rejected = submit(&system, user, EntryType::Debit, 150, None).await;
    assert_eq!(rejected.status, 422);

    let balance = system.ledger().get_balance_snapshot(user).await.unwrap().unwrap();
    assert_eq!(balance.amount, usd(100));
    assert_eq!(balance.version, 2);
    assert_eq!(system.list_transactions(user, None).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_credits_same_user() {
    let (system, user) = setup().await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let system = Arc::clone(&system);
            tokio::spawn(async move { submit(&system, user, EntryType::Credit, 50, None).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().status, 201);
    }

    let balance = system.ledger().get_balance_snapshot(user).await.unwrap().unwrap();
    assert_eq!(balance.amount, usd(100));
    assert_eq!(balance.version, 3);
}

#[tokio::test]
async fn test_entries_round_trip_through_storage() {
    let (system, user) = setup().await;

    let created = submit(&system, user, EntryType::Credit, 12, None).await;
    let listed = system.list_transactions(user, None).await.unwrap();

    assert_eq!(listed, vec![created.entry().unwrap()]);
    assert_eq!(listed[0].amount.to_string(), "12.00");
}

#[tokio::test]
async fn test_idempotent_replay_is_identical() {
    let (system, user) = setup().await;

    let first = submit(&system, user, EntryType::Credit, 50, Some("abc")).await;
    let retry = submit(&system, user, EntryType::Credit, 50, Some("abc")).await;

    assert!(retry.replayed);
    assert_eq!(retry.status, first.status);
    assert_eq!(
        serde_json::to_string(&retry.body).unwrap(),
        serde_json::to_string(&first.body).unwrap()
    );
    assert_eq!(system.get_balance(user).await.unwrap(), usd(50));
    assert_eq!(system.list_transactions(user, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_request() {
    let (system, user) = setup().await;

    submit(&system, user, EntryType::Credit, 5, Some("k1")).await;
    let reused = submit(&system, user, EntryType::Debit, 5, Some("k1")).await;

    assert_eq!(reused.status, 422);
    assert_eq!(reused.error_code(), Some("IDEMPOTENCY_KEY_MISMATCH"));
    assert_eq!(system.get_balance(user).await.unwrap(), usd(5));
}

#[tokio::test]
async fn test_list_filter_by_type() {
    let (system, user) = setup().await;
    submit(&system, user, EntryType::Credit, 10, None).await;
    submit(&system, user, EntryType::Debit, 4, None).await;

    let credits = system
        .list_transactions(user, Some(EntryType::Credit))
        .await
        .unwrap();
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].entry_type, EntryType::Credit);

    let all = system.list_transactions(user, None).await.unwrap();
    assert_eq!(all[0].entry_type, EntryType::Debit);
}

#[tokio::test]
async fn test_unknown_user_has_zero_balance() {
    let (system, user) = setup().await;

    assert_eq!(system.get_balance(user).await.unwrap(), Decimal::ZERO);
    assert!(system.list_transactions(user, None).await.unwrap().is_empty());
}
