use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::Utc;

use storage_order_orchestrator::adapter::{
    Adapter, RemotePlan, RemoteTxProgress, RemoteTxState, StorageTransactionOutcome,
    StorageTransactionRequest,
};
use storage_order_orchestrator::domain::{
    NetworkType, Order, OrderStatus, Payment, PaymentStatus, PlanStatus, Provider, ProviderStatus,
    StoragePlan, User,
};
use storage_order_orchestrator::error::{Error, Result as AdapterResult};
use storage_order_orchestrator::store::{InMemoryStore, Store};

/// A controllable adapter double: submission either always succeeds with a
/// deterministic hash, or always fails with a fixed message. Confirmation
/// status is whatever `confirm_as` was configured to report.
#[derive(Debug)]
pub struct MockAdapter {
    slug: String,
    submissions_fail: bool,
    confirm_as: RemoteTxState,
    confirmations: StdMutex<u32>,
    submit_count: AtomicU32,
}

impl MockAdapter {
    pub fn succeeding(slug: &str, confirm_as: RemoteTxState) -> Self {
        Self {
            slug: slug.to_string(),
            submissions_fail: false,
            confirm_as,
            confirmations: StdMutex::new(6),
            submit_count: AtomicU32::new(0),
        }
    }

    pub fn failing(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            submissions_fail: true,
            confirm_as: RemoteTxState::Failed,
            confirmations: StdMutex::new(0),
            submit_count: AtomicU32::new(0),
        }
    }

    pub fn submit_count(&self) -> u32 {
        self.submit_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn initialize(&self) -> AdapterResult<()> {
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn get_available_plans(&self) -> AdapterResult<Vec<RemotePlan>> {
        Ok(Vec::new())
    }

    async fn sync_plans(&self) -> AdapterResult<Vec<RemotePlan>> {
        Ok(Vec::new())
    }

    async fn execute_storage_transaction(
        &self,
        request: StorageTransactionRequest,
    ) -> AdapterResult<StorageTransactionOutcome> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        if self.submissions_fail {
            return Err(Error::from_provider(&self.slug, "out of funds"));
        }
        Ok(StorageTransactionOutcome {
            tx_hash: format!("0xDEAD{}", request.order_id),
            confirmations: 0,
            storage_id: Some(format!("storage-{}", request.order_id)),
            storage_endpoint: Some("https://mock.storage/endpoint".into()),
            storage_metadata: None,
            raw_response: None,
        })
    }

    async fn check_transaction_status(&self, _tx_hash: &str) -> AdapterResult<RemoteTxProgress> {
        Ok(RemoteTxProgress {
            state: self.confirm_as,
            confirmations: *self.confirmations.lock().unwrap(),
            block_number: Some(100),
            block_hash: None,
            gas_used: None,
            message: if self.confirm_as == RemoteTxState::Failed {
                Some("out of funds".to_string())
            } else {
                None
            },
        })
    }

    async fn get_transaction_explorer_url(&self, tx_hash: &str) -> Option<String> {
        Some(format!("https://explorer.mock/message/{tx_hash}"))
    }
}

pub struct Seeded {
    pub user: User,
    pub provider: Provider,
    pub plan: StoragePlan,
}

/// Seeds a user, an enabled provider and one available plan, mirroring the
/// `u1` / `fil-starter-1gb` fixture used throughout the scenario tests.
pub async fn seed_fixture(store: &InMemoryStore, slug: &str, price_cents: i64, duration_days: u32) -> Seeded {
    let now = Utc::now();
    let user = store
        .create_user(User {
            id: "u1".into(),
            email: "buyer@example.com".into(),
            wallet_address: None,
            processor_customer_id: None,
            created_at: now,
        })
        .await
        .unwrap();
    let provider = store
        .create_provider(Provider {
            id: format!("provider-{slug}"),
            slug: slug.to_string(),
            network: NetworkType::Mainnet,
            chain_id: Some(314),
            status: ProviderStatus::Active,
            enabled: true,
        })
        .await
        .unwrap();
    let plan = store
        .create_plan(StoragePlan {
            id: format!("plan-{slug}"),
            provider_id: provider.id.clone(),
            external_plan_id: format!("{slug}-starter-1gb"),
            size_gb: 1,
            size_bytes: 1_073_741_824,
            duration_days,
            price_cents,
            price_native: Some("0.001".into()),
            currency: "usd".into(),
            status: PlanStatus::Available,
            active: true,
            version: 1,
        })
        .await
        .unwrap();
    Seeded { user, provider, plan }
}

/// Mirrors `initiate_checkout`'s order/payment construction without going
/// through the checkout module, so tests can drive the webhook directly
/// against a known session id.
pub async fn seed_pending_order(
    store: &InMemoryStore,
    seeded: &Seeded,
    session_id: &str,
) -> Order {
    let now = Utc::now();
    let order = Order {
        id: format!("order-{session_id}"),
        order_number: "ORD-00000001".into(),
        user_id: seeded.user.id.clone(),
        provider_id: seeded.provider.id.clone(),
        plan_id: seeded.plan.id.clone(),
        size_gb: seeded.plan.size_gb,
        size_bytes: seeded.plan.size_bytes,
        duration_days: seeded.plan.duration_days,
        price_cents: seeded.plan.price_cents,
        status: OrderStatus::PendingPayment,
        status_message: None,
        idempotency_key: None,
        storage_id: None,
        storage_endpoint: None,
        storage_metadata: None,
        paid_at: None,
        allocated_at: None,
        expires_at: None,
        created_at: now,
        updated_at: now,
    };
    let payment = Payment {
        id: format!("payment-{session_id}"),
        order_id: order.id.clone(),
        user_id: seeded.user.id.clone(),
        amount_cents: order.price_cents,
        currency: "usd".into(),
        processor_payment_intent_id: None,
        processor_session_id: Some(session_id.to_string()),
        status: PaymentStatus::Pending,
        idempotency_key: None,
        processed_at: None,
        last_processor_error: None,
        created_at: now,
        updated_at: now,
    };
    let (order, _payment) = store.create_checkout(order, payment).await.unwrap();
    order
}

pub fn webhook_payload(event_type: &str, session_id: &str, payment_intent_id: &str) -> Vec<u8> {
    serde_json::json!({
        "type": event_type,
        "data": {
            "object": {
                "id": session_id,
                "payment_intent": payment_intent_id,
                "metadata": { "orderId": session_id },
            }
        }
    })
    .to_string()
    .into_bytes()
}
