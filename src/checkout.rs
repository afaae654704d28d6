//! Checkout Initiator: turns a (provider, plan) selection into a pending
//! Order, a pending Payment, and a hosted checkout session the caller
//! redirects the user to.

use tracing::instrument;
use uuid::Uuid;

use crate::adapter::Registry;
use crate::domain::{BlockchainTransaction, Order, OrderStatus, Payment, PaymentStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::processor::{CreateSessionRequest, PaymentProcessor};
use crate::store::Store;

#[derive(Clone)]
pub struct CheckoutRequest {
    pub user_id: String,
    pub user_email: String,
    pub provider_slug: String,
    pub plan_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutResult {
    pub order: Order,
    /// `None` when a resumed session has expired upstream; the caller should
    /// retry `initiate_checkout` with a fresh idempotency key to get a new one.
    pub session_url: Option<String>,
}

#[instrument(skip(store, registry, processor, request), fields(provider = %request.provider_slug, plan = %request.plan_id))]
pub async fn initiate_checkout<S: Store, P: PaymentProcessor>(
    store: &S,
    registry: &Registry,
    processor: &P,
    request: CheckoutRequest,
) -> Result<CheckoutResult> {
    if let Some(key) = &request.idempotency_key {
        if let Some(existing) = store
            .find_order_by_idempotency_key(key)
            .await
            .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
        {
            let payment = store
                .get_latest_payment(&existing.id)
                .await
                .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
                .ok_or_else(|| Error::not_found("payment for existing order"))?;
            return resume_or_create_session(
                store,
                processor,
                existing,
                payment,
                &request.user_id,
                &request.user_email,
            )
            .await;
        }
    }

    store
        .get_user(&request.user_id)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
        .ok_or_else(|| Error::new(ErrorKind::UserNotFound, format!("user '{}'", request.user_id)))?;

    let provider = store
        .get_provider_by_slug(&request.provider_slug)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
        .ok_or_else(|| Error::not_found(format!("provider '{}'", request.provider_slug)))?;
    if !provider.enabled {
        return Err(Error::validation(format!(
            "provider '{}' is not enabled",
            request.provider_slug
        )));
    }

    let adapter = registry
        .get_or_none(&request.provider_slug)
        .ok_or_else(|| Error::not_found(format!("adapter for '{}'", request.provider_slug)))?;
    if !adapter.is_available().await {
        return Err(Error::new(
            ErrorKind::ProviderError,
            format!("provider '{}' is currently unavailable", request.provider_slug),
        ));
    }

    let plan = store
        .get_plan(&request.plan_id)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
        .ok_or_else(|| Error::not_found(format!("plan '{}'", request.plan_id)))?;
    if plan.provider_id != provider.id {
        return Err(Error::validation("plan does not belong to the selected provider"));
    }
    if plan.status != crate::domain::PlanStatus::Available || !plan.active {
        return Err(Error::new(ErrorKind::PlanUnavailable, "plan is not available"));
    }

    let now = chrono::Utc::now();
    let order = Order {
        id: Uuid::new_v4().to_string(),
        order_number: String::new(),
        user_id: request.user_id.clone(),
        provider_id: provider.id.clone(),
        plan_id: plan.id.clone(),
        size_gb: plan.size_gb,
        size_bytes: plan.size_bytes,
        duration_days: plan.duration_days,
        price_cents: plan.price_cents,
        status: OrderStatus::PendingPayment,
        status_message: None,
        idempotency_key: request.idempotency_key.clone(),
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
        id: Uuid::new_v4().to_string(),
        order_id: order.id.clone(),
        user_id: request.user_id.clone(),
        amount_cents: plan.price_cents,
        currency: plan.currency.clone(),
        processor_payment_intent_id: None,
        processor_session_id: None,
        status: PaymentStatus::Pending,
        idempotency_key: request.idempotency_key.clone(),
        processed_at: None,
        last_processor_error: None,
        created_at: now,
        updated_at: now,
    };

    let (order, payment) = store
        .create_checkout(order, payment)
        .await
        .map_err(|e| Error::conflict(e.to_string()))?;

    resume_or_create_session(
        store,
        processor,
        order,
        payment,
        &request.user_id,
        &request.user_email,
    )
    .await
}

/// An order plus its latest payment and latest blockchain transaction, with
/// the transaction's explorer URL formatted by whichever adapter owns the
/// order's provider.
#[derive(Debug, Clone)]
pub struct OrderView {
    pub order: Order,
    pub payment: Option<Payment>,
    pub transaction: Option<BlockchainTransaction>,
    pub explorer_url: Option<String>,
}

#[instrument(skip(store, registry))]
pub async fn get_order_view<S: Store>(
    store: &S,
    registry: &Registry,
    order_id: &str,
) -> Result<OrderView> {
    let order = store
        .get_order(order_id)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
        .ok_or_else(|| Error::not_found(format!("order '{order_id}'")))?;
    let payment = store
        .get_latest_payment(order_id)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
    let transaction = store
        .get_latest_transaction(order_id)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;

    let explorer_url = match (&transaction, store.get_provider(&order.provider_id).await) {
        (Some(tx), Ok(Some(provider))) => match tx.tx_hash.as_deref() {
            Some(hash) => match registry.get_or_none(&provider.slug) {
                Some(adapter) => adapter.get_transaction_explorer_url(hash).await,
                None => None,
            },
            None => None,
        },
        _ => None,
    };

    Ok(OrderView {
        order,
        payment,
        transaction,
        explorer_url,
    })
}

async fn resume_or_create_session<S: Store, P: PaymentProcessor>(
    store: &S,
    processor: &P,
    order: Order,
    payment: Payment,
    user_id: &str,
    user_email: &str,
) -> Result<CheckoutResult> {
    if let Some(session_id) = &payment.processor_session_id {
        return match processor.get_checkout_session(session_id).await? {
            Some(session) => {
                cache_processor_customer_id(store, user_id, &session).await?;
                Ok(CheckoutResult {
                    session_url: Some(session.session_url),
                    order,
                })
            }
            None => Ok(CheckoutResult {
                session_url: None,
                order,
            }),
        };
    }

    let session = processor
        .create_checkout_session(CreateSessionRequest {
            order_id: order.id.clone(),
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            customer_email: user_email.to_string(),
            idempotency_key: payment.idempotency_key.clone(),
        })
        .await?;

    store
        .set_payment_session(&payment.id, &session.session_id)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
    cache_processor_customer_id(store, user_id, &session).await?;

    Ok(CheckoutResult {
        session_url: Some(session.session_url),
        order,
    })
}

#[instrument(skip(store))]
pub async fn cancel_order<S: Store>(store: &S, order_id: &str) -> Result<Order> {
    store
        .cancel_order(order_id)
        .await
        .map_err(|e| Error::new(ErrorKind::InvalidOrderStatus, e.to_string()))
}

async fn cache_processor_customer_id<S: Store>(
    store: &S,
    user_id: &str,
    session: &crate::processor::CheckoutSession,
) -> Result<()> {
    if let Some(customer_id) = &session.customer_id {
        store
            .set_user_processor_customer_id(user_id, customer_id)
            .await
            .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        Adapter, RemotePlan, RemoteTxProgress, StorageTransactionOutcome, StorageTransactionRequest,
    };
    use crate::domain::{NetworkType, PlanStatus, Provider, ProviderStatus, User};
    use crate::processor::MockPaymentProcessor;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct StubAdapter {
        slug: String,
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn slug(&self) -> &str {
            &self.slug
        }
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn get_available_plans(&self) -> Result<Vec<RemotePlan>> {
            Ok(Vec::new())
        }
        async fn sync_plans(&self) -> Result<Vec<RemotePlan>> {
            Ok(Vec::new())
        }
        async fn execute_storage_transaction(
            &self,
            _request: StorageTransactionRequest,
        ) -> Result<StorageTransactionOutcome> {
            unimplemented!("not exercised by checkout tests")
        }
        async fn check_transaction_status(&self, _tx_hash: &str) -> Result<RemoteTxProgress> {
            unimplemented!("not exercised by checkout tests")
        }
        async fn get_transaction_explorer_url(&self, _tx_hash: &str) -> Option<String> {
            None
        }
    }

    struct Fixture {
        store: InMemoryStore,
        registry: Registry,
        processor: MockPaymentProcessor,
    }

    async fn seed() -> Fixture {
        let store = InMemoryStore::new();
        store
            .create_user(User {
                id: "u1".into(),
                email: "buyer@example.com".into(),
                wallet_address: None,
                processor_customer_id: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        store
            .create_provider(Provider {
                id: "provider-fil".into(),
                slug: "fil".into(),
                network: NetworkType::Mainnet,
                chain_id: Some(314),
                status: ProviderStatus::Active,
                enabled: true,
            })
            .await
            .unwrap();
        store
            .create_plan(crate::domain::StoragePlan {
                id: "plan-fil".into(),
                provider_id: "provider-fil".into(),
                external_plan_id: "fil-starter-1gb".into(),
                size_gb: 1,
                size_bytes: 1_073_741_824,
                duration_days: 180,
                price_cents: 99,
                price_native: Some("0.001".into()),
                currency: "usd".into(),
                status: PlanStatus::Available,
                active: true,
                version: 1,
            })
            .await
            .unwrap();

        let mut registry = Registry::new();
        registry.register(Box::new(StubAdapter { slug: "fil".into() }));

        Fixture {
            store,
            registry,
            processor: MockPaymentProcessor::new(),
        }
    }

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            user_id: "u1".into(),
            user_email: "buyer@example.com".into(),
            provider_slug: "fil".into(),
            plan_id: "plan-fil".into(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn rejects_nonexistent_user() {
        let f = seed().await;
        let mut req = request();
        req.user_id = "ghost".into();

        let err = initiate_checkout(&f.store, &f.registry, &f.processor, req)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UserNotFound);
    }

    #[tokio::test]
    async fn rejects_inactive_plan() {
        let f = seed().await;
        f.store
            .create_plan(crate::domain::StoragePlan {
                id: "plan-inactive".into(),
                provider_id: "provider-fil".into(),
                external_plan_id: "fil-legacy-1gb".into(),
                size_gb: 1,
                size_bytes: 1_073_741_824,
                duration_days: 180,
                price_cents: 99,
                price_native: None,
                currency: "usd".into(),
                status: PlanStatus::Available,
                active: false,
                version: 1,
            })
            .await
            .unwrap();
        let mut req = request();
        req.plan_id = "plan-inactive".into();

        let err = initiate_checkout(&f.store, &f.registry, &f.processor, req)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PlanUnavailable);
    }

    #[tokio::test]
    async fn first_checkout_creates_session_and_caches_customer_id() {
        let f = seed().await;
        let result = initiate_checkout(&f.store, &f.registry, &f.processor, request())
            .await
            .unwrap();
        assert!(result.session_url.is_some());

        let user = f.store.get_user("u1").await.unwrap().unwrap();
        assert!(user.processor_customer_id.is_some());
        let payment = f
            .store
            .get_latest_payment(&result.order.id)
            .await
            .unwrap()
            .unwrap();
        assert!(payment.processor_session_id.is_some());
    }

    #[tokio::test]
    async fn resuming_with_idempotency_key_re_fetches_live_session() {
        let f = seed().await;
        let mut req = request();
        req.idempotency_key = Some("idem-1".into());

        let first = initiate_checkout(&f.store, &f.registry, &f.processor, req.clone())
            .await
            .unwrap();
        let second = initiate_checkout(&f.store, &f.registry, &f.processor, req)
            .await
            .unwrap();

        assert_eq!(first.order.id, second.order.id);
        assert_eq!(first.session_url, second.session_url);
    }

    #[tokio::test]
    async fn resuming_an_expired_session_returns_no_session_url() {
        let f = seed().await;
        let mut req = request();
        req.idempotency_key = Some("idem-2".into());

        let first = initiate_checkout(&f.store, &f.registry, &f.processor, req.clone())
            .await
            .unwrap();
        let payment = f
            .store
            .get_latest_payment(&first.order.id)
            .await
            .unwrap()
            .unwrap();
        f.processor
            .expire_session(payment.processor_session_id.as_deref().unwrap())
            .await;

        let second = initiate_checkout(&f.store, &f.registry, &f.processor, req)
            .await
            .unwrap();
        assert_eq!(second.order.id, first.order.id);
        assert!(second.session_url.is_none());
    }

    #[tokio::test]
    async fn cancel_order_wraps_store_error_as_invalid_order_status() {
        let f = seed().await;
        let result = initiate_checkout(&f.store, &f.registry, &f.processor, request())
            .await
            .unwrap();

        let cancelled = cancel_order(&f.store, &result.order.id).await.unwrap();
        assert_eq!(cancelled.status, crate::domain::OrderStatus::Cancelled);

        let err = cancel_order(&f.store, &result.order.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidOrderStatus);
    }
}
