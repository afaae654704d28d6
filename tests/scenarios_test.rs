//! End-to-end order-lifecycle scenarios. Each test drives the real
//! `ingest_webhook` / `Orchestrator` / `InMemoryStore` stack against a
//! [`support::MockAdapter`], the same way an integration test drives a real
//! orchestrator against a mock adapter and payment processor.

mod support;

use std::sync::Arc;
use std::time::Duration;

use storage_order_orchestrator::adapter::{RemoteTxState, Registry};
use storage_order_orchestrator::checkout::get_order_view;
use storage_order_orchestrator::domain::{OrderStatus, PaymentStatus, TransactionStatus};
use storage_order_orchestrator::orchestrator::Orchestrator;
use storage_order_orchestrator::processor::MockPaymentProcessor;
use storage_order_orchestrator::store::{InMemoryStore, Store};
use storage_order_orchestrator::time::DefaultTime;
use storage_order_orchestrator::webhook::ingest_webhook;

use support::{seed_fixture, seed_pending_order, webhook_payload, MockAdapter};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Scenario 1: happy path through checkout completion, submission and
/// confirmation.
#[tokio::test]
async fn happy_path_evm_order_completes() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_fixture(&store, "fil", 99, 180).await;
    let order = seed_pending_order(&store, &seeded, "sess_1").await;

    let mut registry = Registry::new();
    registry.register(Box::new(MockAdapter::succeeding("fil", RemoteTxState::Confirmed)));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(store.clone(), registry, DefaultTime);
    let processor = MockPaymentProcessor::new();

    ingest_webhook(
        store.as_ref(),
        &processor,
        &orchestrator,
        &webhook_payload("checkout.session.completed", "sess_1", "pi_1"),
        "test-signature",
    )
    .await
    .unwrap();
    settle().await;

    let completed = store.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
    assert!(completed.allocated_at.is_some());
    let expected_expiry = completed.allocated_at.unwrap() + chrono::Duration::days(180);
    assert!((completed.expires_at.unwrap() - expected_expiry).num_seconds().abs() <= 1);

    let tx = store.get_latest_transaction(&order.id).await.unwrap().unwrap();
    assert_eq!(tx.tx_hash.as_deref(), Some(format!("0xDEAD{}", order.id).as_str()));
}

/// Once allocation completes, the order view includes the latest payment,
/// the latest transaction, and an explorer URL formatted by the adapter
/// that owns the order's provider.
#[tokio::test]
async fn order_view_includes_payment_transaction_and_explorer_url() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_fixture(&store, "fil", 99, 180).await;
    let order = seed_pending_order(&store, &seeded, "sess_8").await;

    let mut registry = Registry::new();
    registry.register(Box::new(MockAdapter::succeeding("fil", RemoteTxState::Confirmed)));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(store.clone(), registry.clone(), DefaultTime);
    let processor = MockPaymentProcessor::new();

    ingest_webhook(
        store.as_ref(),
        &processor,
        &orchestrator,
        &webhook_payload("checkout.session.completed", "sess_8", "pi_8"),
        "test-signature",
    )
    .await
    .unwrap();
    settle().await;

    let view = get_order_view(store.as_ref(), registry.as_ref(), &order.id)
        .await
        .unwrap();
    assert_eq!(view.order.status, OrderStatus::Completed);
    assert_eq!(view.payment.unwrap().status, PaymentStatus::Succeeded);
    let tx = view.transaction.unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert_eq!(
        view.explorer_url.as_deref(),
        Some(format!("https://explorer.mock/message/{}", tx.tx_hash.unwrap()).as_str())
    );
}

/// Scenario 2: a redelivered `checkout.session.completed` must not create
/// a second payment or a second transaction.
#[tokio::test]
async fn duplicate_webhook_is_a_no_op() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_fixture(&store, "fil", 99, 180).await;
    let order = seed_pending_order(&store, &seeded, "sess_2").await;

    let mut registry = Registry::new();
    registry.register(Box::new(MockAdapter::succeeding("fil", RemoteTxState::Confirmed)));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(store.clone(), registry, DefaultTime);
    let processor = MockPaymentProcessor::new();

    let payload = webhook_payload("checkout.session.completed", "sess_2", "pi_2");
    ingest_webhook(store.as_ref(), &processor, &orchestrator, &payload, "test-signature")
        .await
        .unwrap();
    settle().await;
    ingest_webhook(store.as_ref(), &processor, &orchestrator, &payload, "test-signature")
        .await
        .unwrap();
    settle().await;

    let payments = store.get_latest_payment(&order.id).await.unwrap().unwrap();
    assert_eq!(payments.status, PaymentStatus::Succeeded);
    let completed = store.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
}

/// Scenario 3: submission failure drives the order to BLOCKCHAIN_FAILED,
/// and the retry contract allows exactly `maxRetries` (default 3) retries
/// before refusing with MAX_RETRIES.
#[tokio::test]
async fn submission_failure_then_exhausted_retries() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_fixture(&store, "fil", 99, 180).await;
    let order = seed_pending_order(&store, &seeded, "sess_3").await;

    let mut registry = Registry::new();
    registry.register(Box::new(MockAdapter::failing("fil")));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(store.clone(), registry, DefaultTime);
    let processor = MockPaymentProcessor::new();

    ingest_webhook(
        store.as_ref(),
        &processor,
        &orchestrator,
        &webhook_payload("checkout.session.completed", "sess_3", "pi_3"),
        "test-signature",
    )
    .await
    .unwrap();
    settle().await;

    let failed = store.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(failed.status, OrderStatus::BlockchainFailed);
    let tx = store.get_latest_transaction(&order.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(
        tx.status_message.as_deref(),
        Some("PROVIDER_ERROR: provider 'fil': out of funds")
    );

    for _ in 0..2 {
        orchestrator.retry_transaction(&tx.id).await.unwrap();
        settle().await;
    }
    let tx = store.get_latest_transaction(&order.id).await.unwrap().unwrap();
    assert_eq!(tx.retry_count, 2);
    assert_eq!(tx.status, TransactionStatus::Failed);

    orchestrator.retry_transaction(&tx.id).await.unwrap();
    settle().await;
    let tx = store.get_latest_transaction(&order.id).await.unwrap().unwrap();
    assert_eq!(tx.retry_count, 3);

    let err = orchestrator.retry_transaction(&tx.id).await.unwrap_err();
    assert_eq!(err.kind, storage_order_orchestrator::ErrorKind::MaxRetries);
    assert!(tx.retry_count <= storage_order_orchestrator::domain::DEFAULT_MAX_RETRIES);
}

/// Scenario 4: a session-expired event followed by a late completion must
/// leave the order CANCELLED — `checkout.session.completed` cannot revive
/// a terminal payment.
#[tokio::test]
async fn expired_session_blocks_late_completion() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_fixture(&store, "fil", 99, 180).await;
    let order = seed_pending_order(&store, &seeded, "sess_4").await;

    let mut registry = Registry::new();
    registry.register(Box::new(MockAdapter::succeeding("fil", RemoteTxState::Confirmed)));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(store.clone(), registry, DefaultTime);
    let processor = MockPaymentProcessor::new();

    ingest_webhook(
        store.as_ref(),
        &processor,
        &orchestrator,
        &webhook_payload("checkout.session.expired", "sess_4", "pi_4"),
        "test-signature",
    )
    .await
    .unwrap();
    ingest_webhook(
        store.as_ref(),
        &processor,
        &orchestrator,
        &webhook_payload("checkout.session.completed", "sess_4", "pi_4"),
        "test-signature",
    )
    .await
    .unwrap();
    settle().await;

    let order = store.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    let payment = store.get_latest_payment(&order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Cancelled);
}

/// Scenario 6: cancelling a PENDING_PAYMENT order, then a late completion
/// webhook, must not schedule an allocation.
#[tokio::test]
async fn cancel_then_late_completion_does_not_allocate() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_fixture(&store, "fil", 99, 180).await;
    let order = seed_pending_order(&store, &seeded, "sess_6").await;
    store.cancel_order(&order.id).await.unwrap();

    let mut registry = Registry::new();
    registry.register(Box::new(MockAdapter::succeeding("fil", RemoteTxState::Confirmed)));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(store.clone(), registry, DefaultTime);
    let processor = MockPaymentProcessor::new();

    ingest_webhook(
        store.as_ref(),
        &processor,
        &orchestrator,
        &webhook_payload("checkout.session.completed", "sess_6", "pi_6"),
        "test-signature",
    )
    .await
    .unwrap();
    settle().await;

    let order = store.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(store
        .find_non_failed_transaction(&order.id)
        .await
        .unwrap()
        .is_none());
}

/// Status never regresses: the happy path never revisits an already-passed
/// state even when the orchestrator is invoked twice in a row for the same
/// order (redelivery).
#[tokio::test]
async fn status_never_regresses_under_redelivery() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_fixture(&store, "fil", 99, 180).await;
    let order = seed_pending_order(&store, &seeded, "sess_7").await;
    store
        .complete_payment_and_order("sess_7", "pi_7", None)
        .await
        .unwrap();

    let mut registry = Registry::new();
    registry.register(Box::new(MockAdapter::succeeding("fil", RemoteTxState::Confirmed)));
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(store.clone(), registry, DefaultTime);

    orchestrator.run_allocation(&order.id).await;
    settle().await;
    let after_first = store.get_order(&order.id).await.unwrap().unwrap();

    orchestrator.run_allocation(&order.id).await;
    settle().await;
    let after_second = store.get_order(&order.id).await.unwrap().unwrap();

    assert_eq!(after_first.status, after_second.status);
    assert_eq!(after_first.status, OrderStatus::Completed);
    let _ = seeded.plan.id;
}
