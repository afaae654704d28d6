//! Persistence contract and a reference in-memory implementation.
//!
//! A production deployment swaps in a store backed by a real RDBMS; the
//! trait here only promises what the orchestrator actually needs: primary-
//! key lookup, unique-index lookup, and atomic multi-row updates gated on
//! the row's current status. [`InMemoryStore`] honors that contract with a
//! single process-wide lock — a simple, honest stand-in for a dependency
//! the core doesn't want to own outright.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::*;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unique constraint violated: {0}")]
    Conflict(&'static str),

    #[error("invalid order status: expected {expected}, found {found}")]
    InvalidOrderStatus { expected: String, found: String },

    #[error("transaction is not eligible for retry: {0}")]
    NotRetryable(&'static str),
}

#[async_trait]
pub trait Store: Debug + Send + Sync {
    type Error: std::error::Error + Send + Sync + Clone + 'static;

    async fn create_user(&self, user: User) -> Result<User, Self::Error>;
    async fn get_user(&self, id: &str) -> Result<Option<User>, Self::Error>;
    async fn set_user_processor_customer_id(
        &self,
        user_id: &str,
        customer_id: &str,
    ) -> Result<(), Self::Error>;

    async fn create_provider(&self, provider: Provider) -> Result<Provider, Self::Error>;
    async fn get_provider(&self, id: &str) -> Result<Option<Provider>, Self::Error>;
    async fn get_provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, Self::Error>;

    async fn create_plan(&self, plan: StoragePlan) -> Result<StoragePlan, Self::Error>;
    async fn get_plan(&self, id: &str) -> Result<Option<StoragePlan>, Self::Error>;
    async fn list_plans_by_provider(
        &self,
        provider_id: &str,
    ) -> Result<Vec<StoragePlan>, Self::Error>;
    /// Reconciles one remote plan observation: inserts if absent, bumps
    /// `version` and updates fields if changed, leaves untouched if
    /// identical. Returns which of the three happened.
    async fn upsert_synced_plan(
        &self,
        provider_id: &str,
        external_plan_id: &str,
        fields: PlanFields,
    ) -> Result<SyncOutcome, Self::Error>;
    /// Marks every plan of `provider_id` absent from `seen_external_ids` as
    /// UNAVAILABLE. Returns the count touched.
    async fn mark_missing_plans_unavailable(
        &self,
        provider_id: &str,
        seen_external_ids: &[String],
    ) -> Result<u32, Self::Error>;

    async fn find_order_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Order>, Self::Error>;
    /// Atomically creates the Order + Payment pair.
    async fn create_checkout(
        &self,
        order: Order,
        payment: Payment,
    ) -> Result<(Order, Payment), Self::Error>;
    async fn get_order(&self, id: &str) -> Result<Option<Order>, Self::Error>;
    async fn get_latest_payment(&self, order_id: &str) -> Result<Option<Payment>, Self::Error>;
    async fn get_latest_transaction(
        &self,
        order_id: &str,
    ) -> Result<Option<BlockchainTransaction>, Self::Error>;
    async fn set_payment_session(
        &self,
        payment_id: &str,
        session_id: &str,
    ) -> Result<(), Self::Error>;
    async fn cancel_order(&self, order_id: &str) -> Result<Order, Self::Error>;

    async fn complete_payment_and_order(
        &self,
        session_id: &str,
        payment_intent_id: &str,
        metadata: Option<Json>,
    ) -> Result<Option<(Order, Payment)>, Self::Error>;
    async fn expire_payment_and_order(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<bool, Self::Error>;
    async fn mark_payment_intent_succeeded(
        &self,
        payment_intent_id: &str,
    ) -> Result<bool, Self::Error>;
    async fn fail_payment_and_order(
        &self,
        payment_intent_id: &str,
        error: &str,
    ) -> Result<bool, Self::Error>;

    async fn find_non_failed_transaction(
        &self,
        order_id: &str,
    ) -> Result<Option<BlockchainTransaction>, Self::Error>;
    async fn begin_allocation(&self, order_id: &str) -> Result<BlockchainTransaction, Self::Error>;
    /// Flips `BLOCKCHAIN_PENDING` to `BLOCKCHAIN_PROCESSING` right before
    /// the adapter is actually invoked, so a failed submission always fails
    /// from `BLOCKCHAIN_PROCESSING`, never directly from
    /// `BLOCKCHAIN_PENDING`.
    async fn start_processing(&self, order_id: &str) -> Result<Order, Self::Error>;
    async fn record_submission_success(
        &self,
        tx_id: &str,
        update: SubmissionSuccess,
    ) -> Result<BlockchainTransaction, Self::Error>;
    async fn record_submission_failure(
        &self,
        tx_id: &str,
        message: &str,
    ) -> Result<BlockchainTransaction, Self::Error>;
    async fn retry_transaction(&self, tx_id: &str) -> Result<BlockchainTransaction, Self::Error>;

    async fn update_transaction_progress(
        &self,
        tx_id: &str,
        update: TransactionProgress,
    ) -> Result<BlockchainTransaction, Self::Error>;
    async fn complete_order(&self, order_id: &str) -> Result<Order, Self::Error>;
    async fn fail_order_blockchain(
        &self,
        order_id: &str,
        message: &str,
    ) -> Result<Order, Self::Error>;
    async fn get_transaction(&self, tx_id: &str) -> Result<Option<BlockchainTransaction>, Self::Error>;
    async fn list_transactions_for_sweep(&self) -> Result<Vec<BlockchainTransaction>, Self::Error>;
    async fn list_orders_needing_dispatch(&self) -> Result<Vec<Order>, Self::Error>;

    async fn record_sync_log(&self, log: ProviderSyncLog) -> Result<(), Self::Error>;
    async fn get_config(&self, key: &str) -> Result<Option<String>, Self::Error>;
    async fn set_config(&self, key: &str, value: &str) -> Result<(), Self::Error>;
}

/// Fields carried by a single remote plan observation during sync.
#[derive(Debug, Clone)]
pub struct PlanFields {
    pub size_gb: u32,
    pub size_bytes: u64,
    pub duration_days: u32,
    pub price_cents: Cents,
    pub price_native: Option<String>,
    pub currency: String,
    pub status: PlanStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Added,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct SubmissionSuccess {
    pub tx_hash: String,
    pub status: TransactionStatus,
    pub storage_id: Option<String>,
    pub storage_endpoint: Option<String>,
    pub storage_metadata: Option<Json>,
    pub raw_response: Option<Json>,
}

#[derive(Debug, Clone)]
pub struct TransactionProgress {
    pub status: TransactionStatus,
    pub confirmations: u32,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub gas_used: Option<String>,
    pub status_message: Option<String>,
}

// --- In-memory reference implementation -------------------------------

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, User>,
    providers: HashMap<String, Provider>,
    plans: HashMap<String, StoragePlan>,
    orders: HashMap<String, Order>,
    payments: HashMap<String, Payment>,
    transactions: HashMap<String, BlockchainTransaction>,
    sync_logs: Vec<ProviderSyncLog>,
    config: HashMap<String, String>,
}

/// A `tokio::sync::Mutex`-guarded store. One lock, held only across the
/// synchronous mutation itself, never across a remote call — the same
/// discipline the poller owes its own adapter calls.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn order_number(seq: u64) -> String {
    format!("ORD-{seq:08}")
}

#[async_trait]
impl Store for InMemoryStore {
    type Error = StoreError;

    async fn create_user(&self, mut user: User) -> Result<User, Self::Error> {
        let mut t = self.tables.lock().await;
        user.email = user.email.to_lowercase();
        if t.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("users.email"));
        }
        t.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, Self::Error> {
        Ok(self.tables.lock().await.users.get(id).cloned())
    }

    async fn set_user_processor_customer_id(
        &self,
        user_id: &str,
        customer_id: &str,
    ) -> Result<(), Self::Error> {
        let mut t = self.tables.lock().await;
        let user = t.users.get_mut(user_id).ok_or(StoreError::NotFound("user"))?;
        user.processor_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn create_provider(&self, provider: Provider) -> Result<Provider, Self::Error> {
        let mut t = self.tables.lock().await;
        if t.providers.values().any(|p| p.slug == provider.slug) {
            return Err(StoreError::Conflict("providers.slug"));
        }
        t.providers.insert(provider.id.clone(), provider.clone());
        Ok(provider)
    }

    async fn get_provider(&self, id: &str) -> Result<Option<Provider>, Self::Error> {
        Ok(self.tables.lock().await.providers.get(id).cloned())
    }

    async fn get_provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, Self::Error> {
        Ok(self
            .tables
            .lock()
            .await
            .providers
            .values()
            .find(|p| p.slug == slug)
            .cloned())
    }

    async fn create_plan(&self, plan: StoragePlan) -> Result<StoragePlan, Self::Error> {
        let mut t = self.tables.lock().await;
        let dup = t.plans.values().any(|p| {
            p.provider_id == plan.provider_id && p.external_plan_id == plan.external_plan_id
        });
        if dup {
            return Err(StoreError::Conflict("storage_plans.(provider_id,external_plan_id)"));
        }
        t.plans.insert(plan.id.clone(), plan.clone());
        Ok(plan)
    }

    async fn get_plan(&self, id: &str) -> Result<Option<StoragePlan>, Self::Error> {
        Ok(self.tables.lock().await.plans.get(id).cloned())
    }

    async fn list_plans_by_provider(
        &self,
        provider_id: &str,
    ) -> Result<Vec<StoragePlan>, Self::Error> {
        Ok(self
            .tables
            .lock()
            .await
            .plans
            .values()
            .filter(|p| p.provider_id == provider_id)
            .cloned()
            .collect())
    }

    async fn upsert_synced_plan(
        &self,
        provider_id: &str,
        external_plan_id: &str,
        fields: PlanFields,
    ) -> Result<SyncOutcome, Self::Error> {
        let mut t = self.tables.lock().await;
        let existing = t
            .plans
            .values_mut()
            .find(|p| p.provider_id == provider_id && p.external_plan_id == external_plan_id);

        match existing {
            None => {
                let plan = StoragePlan {
                    id: Uuid::new_v4().to_string(),
                    provider_id: provider_id.to_string(),
                    external_plan_id: external_plan_id.to_string(),
                    size_gb: fields.size_gb,
                    size_bytes: fields.size_bytes,
                    duration_days: fields.duration_days,
                    price_cents: fields.price_cents,
                    price_native: fields.price_native,
                    currency: fields.currency,
                    status: fields.status,
                    active: true,
                    version: 1,
                };
                t.plans.insert(plan.id.clone(), plan);
                Ok(SyncOutcome::Added)
            }
            Some(plan) => {
                let changed = plan.size_gb != fields.size_gb
                    || plan.size_bytes != fields.size_bytes
                    || plan.duration_days != fields.duration_days
                    || plan.price_cents != fields.price_cents
                    || plan.price_native != fields.price_native
                    || plan.currency != fields.currency
                    || plan.status != fields.status;
                if !changed {
                    return Ok(SyncOutcome::Unchanged);
                }
                plan.size_gb = fields.size_gb;
                plan.size_bytes = fields.size_bytes;
                plan.duration_days = fields.duration_days;
                plan.price_cents = fields.price_cents;
                plan.price_native = fields.price_native;
                plan.currency = fields.currency;
                plan.status = fields.status;
                plan.version += 1;
                Ok(SyncOutcome::Updated)
            }
        }
    }

    async fn mark_missing_plans_unavailable(
        &self,
        provider_id: &str,
        seen_external_ids: &[String],
    ) -> Result<u32, Self::Error> {
        let mut t = self.tables.lock().await;
        let mut touched = 0;
        for plan in t.plans.values_mut() {
            if plan.provider_id == provider_id
                && plan.status != PlanStatus::Unavailable
                && !seen_external_ids.contains(&plan.external_plan_id)
            {
                plan.status = PlanStatus::Unavailable;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn find_order_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Order>, Self::Error> {
        Ok(self
            .tables
            .lock()
            .await
            .orders
            .values()
            .find(|o| o.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn create_checkout(
        &self,
        mut order: Order,
        mut payment: Payment,
    ) -> Result<(Order, Payment), Self::Error> {
        let mut t = self.tables.lock().await;
        if let Some(key) = &order.idempotency_key {
            if t.orders.values().any(|o| o.idempotency_key.as_deref() == Some(key.as_str())) {
                return Err(StoreError::Conflict("orders.idempotency_key"));
            }
        }
        order.order_number = order_number(t.orders.len() as u64 + 1);
        payment.order_id = order.id.clone();
        t.orders.insert(order.id.clone(), order.clone());
        t.payments.insert(payment.id.clone(), payment.clone());
        Ok((order, payment))
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, Self::Error> {
        Ok(self.tables.lock().await.orders.get(id).cloned())
    }

    async fn get_latest_payment(&self, order_id: &str) -> Result<Option<Payment>, Self::Error> {
        let t = self.tables.lock().await;
        Ok(t.payments
            .values()
            .filter(|p| p.order_id == order_id)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn get_latest_transaction(
        &self,
        order_id: &str,
    ) -> Result<Option<BlockchainTransaction>, Self::Error> {
        let t = self.tables.lock().await;
        Ok(t.transactions
            .values()
            .filter(|tx| tx.order_id == order_id)
            .max_by_key(|tx| tx.created_at)
            .cloned())
    }

    async fn set_payment_session(
        &self,
        payment_id: &str,
        session_id: &str,
    ) -> Result<(), Self::Error> {
        let mut t = self.tables.lock().await;
        let owned_by_other = t
            .payments
            .values()
            .any(|p| p.processor_session_id.as_deref() == Some(session_id) && p.id != payment_id);
        if owned_by_other {
            return Err(StoreError::Conflict("payments.processor_session_id"));
        }
        let payment = t
            .payments
            .get_mut(payment_id)
            .ok_or(StoreError::NotFound("payment"))?;
        payment.processor_session_id = Some(session_id.to_string());
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Order, Self::Error> {
        let mut t = self.tables.lock().await;
        {
            let order = t
                .orders
                .get(order_id)
                .ok_or(StoreError::NotFound("order"))?;
            if order.status != OrderStatus::PendingPayment {
                return Err(StoreError::InvalidOrderStatus {
                    expected: "PENDING_PAYMENT".into(),
                    found: format!("{:?}", order.status),
                });
            }
        }
        let now = Utc::now();
        let order = t.orders.get_mut(order_id).unwrap();
        order.status = OrderStatus::Cancelled;
        order.updated_at = now;
        let order = order.clone();
        if let Some(payment) = t
            .payments
            .values_mut()
            .filter(|p| p.order_id == order_id)
            .max_by_key(|p| p.created_at)
        {
            payment.status = PaymentStatus::Cancelled;
            payment.updated_at = now;
        }
        Ok(order)
    }

    async fn complete_payment_and_order(
        &self,
        session_id: &str,
        payment_intent_id: &str,
        metadata: Option<Json>,
    ) -> Result<Option<(Order, Payment)>, Self::Error> {
        let mut t = self.tables.lock().await;
        let payment_id = t
            .payments
            .values()
            .find(|p| p.processor_session_id.as_deref() == Some(session_id))
            .map(|p| p.id.clone())
            .ok_or(StoreError::NotFound("payment"))?;

        if t.payments.get(&payment_id).unwrap().status.is_terminal() {
            return Ok(None);
        }

        let now = Utc::now();
        let order_id = {
            let payment = t.payments.get_mut(&payment_id).unwrap();
            payment.status = PaymentStatus::Succeeded;
            payment.processor_payment_intent_id = Some(payment_intent_id.to_string());
            payment.processed_at = Some(now);
            payment.updated_at = now;
            payment.order_id.clone()
        };

        let order = t.orders.get_mut(&order_id).ok_or(StoreError::NotFound("order"))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::PaymentCompleted;
            order.paid_at = Some(now);
            order.updated_at = now;
            if let Some(meta) = metadata {
                order.storage_metadata = Some(meta);
            }
        }
        let order = order.clone();
        let payment = t.payments.get(&payment_id).unwrap().clone();
        Ok(Some((order, payment)))
    }

    async fn expire_payment_and_order(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<bool, Self::Error> {
        let mut t = self.tables.lock().await;
        let payment_id = match t
            .payments
            .values()
            .find(|p| p.processor_session_id.as_deref() == Some(session_id))
            .map(|p| p.id.clone())
        {
            Some(id) => id,
            None => return Ok(false),
        };
        let (already_terminal, order_id) = {
            let payment = t.payments.get(&payment_id).unwrap();
            (payment.status.is_terminal(), payment.order_id.clone())
        };
        if already_terminal {
            return Ok(false);
        }
        let now = Utc::now();
        {
            let payment = t.payments.get_mut(&payment_id).unwrap();
            payment.status = PaymentStatus::Cancelled;
            payment.updated_at = now;
        }
        if let Some(order) = t.orders.get_mut(&order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Cancelled;
                order.status_message = Some(message.to_string());
                order.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn mark_payment_intent_succeeded(
        &self,
        payment_intent_id: &str,
    ) -> Result<bool, Self::Error> {
        let mut t = self.tables.lock().await;
        let payment_id = match t
            .payments
            .values()
            .find(|p| p.processor_payment_intent_id.as_deref() == Some(payment_intent_id))
            .map(|p| p.id.clone())
        {
            Some(id) => id,
            None => return Ok(false),
        };
        let now = Utc::now();
        let payment = t.payments.get_mut(&payment_id).unwrap();
        if payment.status == PaymentStatus::Succeeded {
            return Ok(false);
        }
        payment.status = PaymentStatus::Succeeded;
        payment.processed_at = Some(now);
        payment.updated_at = now;
        Ok(true)
    }

    async fn fail_payment_and_order(
        &self,
        payment_intent_id: &str,
        error: &str,
    ) -> Result<bool, Self::Error> {
        let mut t = self.tables.lock().await;
        let payment_id = match t
            .payments
            .values()
            .find(|p| p.processor_payment_intent_id.as_deref() == Some(payment_intent_id))
            .map(|p| p.id.clone())
        {
            Some(id) => id,
            None => return Ok(false),
        };
        let (already_terminal, order_id) = {
            let payment = t.payments.get(&payment_id).unwrap();
            (payment.status.is_terminal(), payment.order_id.clone())
        };
        if already_terminal {
            return Ok(false);
        }
        let now = Utc::now();
        {
            let payment = t.payments.get_mut(&payment_id).unwrap();
            payment.status = PaymentStatus::Failed;
            payment.last_processor_error = Some(error.to_string());
            payment.updated_at = now;
        }
        if let Some(order) = t.orders.get_mut(&order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::PaymentFailed;
                order.status_message = Some(error.to_string());
                order.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn find_non_failed_transaction(
        &self,
        order_id: &str,
    ) -> Result<Option<BlockchainTransaction>, Self::Error> {
        let t = self.tables.lock().await;
        Ok(t.transactions
            .values()
            .find(|tx| tx.order_id == order_id && tx.status != TransactionStatus::Failed)
            .cloned())
    }

    async fn begin_allocation(&self, order_id: &str) -> Result<BlockchainTransaction, Self::Error> {
        let mut t = self.tables.lock().await;
        let order = t
            .orders
            .get(order_id)
            .ok_or(StoreError::NotFound("order"))?
            .clone();
        if order.status != OrderStatus::PaymentCompleted {
            return Err(StoreError::InvalidOrderStatus {
                expected: "PAYMENT_COMPLETED".into(),
                found: format!("{:?}", order.status),
            });
        }
        let provider = t
            .providers
            .get(&order.provider_id)
            .ok_or(StoreError::NotFound("provider"))?;
        let (network, chain_id) = (provider.network, provider.chain_id);
        let now = Utc::now();
        let tx = BlockchainTransaction {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            provider_id: order.provider_id.clone(),
            network,
            chain_id,
            tx_hash: None,
            status: TransactionStatus::Pending,
            status_message: None,
            confirmations: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            block_number: None,
            block_hash: None,
            gas_used: None,
            submitted_at: None,
            confirmed_at: None,
            last_retry_at: None,
            raw_response: None,
            created_at: now,
            updated_at: now,
        };
        t.transactions.insert(tx.id.clone(), tx.clone());

        let order = t.orders.get_mut(order_id).unwrap();
        order.status = OrderStatus::BlockchainPending;
        order.updated_at = now;
        Ok(tx)
    }

    async fn start_processing(&self, order_id: &str) -> Result<Order, Self::Error> {
        let mut t = self.tables.lock().await;
        let order = t
            .orders
            .get_mut(order_id)
            .ok_or(StoreError::NotFound("order"))?;
        if order.status != OrderStatus::BlockchainPending {
            return Err(StoreError::InvalidOrderStatus {
                expected: "BLOCKCHAIN_PENDING".into(),
                found: format!("{:?}", order.status),
            });
        }
        order.status = OrderStatus::BlockchainProcessing;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn record_submission_success(
        &self,
        tx_id: &str,
        update: SubmissionSuccess,
    ) -> Result<BlockchainTransaction, Self::Error> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let order_id = {
            let tx = t
                .transactions
                .get_mut(tx_id)
                .ok_or(StoreError::NotFound("blockchain_transaction"))?;
            tx.tx_hash = Some(update.tx_hash);
            tx.status = update.status;
            tx.submitted_at = Some(now);
            tx.raw_response = update.raw_response;
            tx.updated_at = now;
            tx.order_id.clone()
        };
        let order = t
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound("order"))?;
        order.storage_id = update.storage_id;
        order.storage_endpoint = update.storage_endpoint;
        order.storage_metadata = update.storage_metadata;
        order.updated_at = now;
        Ok(t.transactions.get(tx_id).unwrap().clone())
    }

    async fn record_submission_failure(
        &self,
        tx_id: &str,
        message: &str,
    ) -> Result<BlockchainTransaction, Self::Error> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let order_id = {
            let tx = t
                .transactions
                .get_mut(tx_id)
                .ok_or(StoreError::NotFound("blockchain_transaction"))?;
            tx.status = TransactionStatus::Failed;
            tx.status_message = Some(message.to_string());
            tx.updated_at = now;
            tx.order_id.clone()
        };
        if let Some(order) = t.orders.get_mut(&order_id) {
            order.status = OrderStatus::BlockchainFailed;
            order.status_message = Some(message.to_string());
            order.updated_at = now;
        }
        Ok(t.transactions.get(tx_id).unwrap().clone())
    }

    async fn retry_transaction(&self, tx_id: &str) -> Result<BlockchainTransaction, Self::Error> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let order_id = {
            let tx = t
                .transactions
                .get_mut(tx_id)
                .ok_or(StoreError::NotFound("blockchain_transaction"))?;
            if tx.status != TransactionStatus::Failed {
                return Err(StoreError::NotRetryable("transaction is not FAILED"));
            }
            if tx.retry_count >= tx.max_retries {
                return Err(StoreError::NotRetryable("max retries exhausted"));
            }
            tx.retry_count += 1;
            tx.last_retry_at = Some(now);
            tx.status = TransactionStatus::Retrying;
            tx.updated_at = now;
            tx.order_id.clone()
        };
        if let Some(order) = t.orders.get_mut(&order_id) {
            order.status = OrderStatus::BlockchainPending;
            order.status_message = None;
            order.updated_at = now;
        }
        Ok(t.transactions.get(tx_id).unwrap().clone())
    }

    async fn update_transaction_progress(
        &self,
        tx_id: &str,
        update: TransactionProgress,
    ) -> Result<BlockchainTransaction, Self::Error> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let tx = t
            .transactions
            .get_mut(tx_id)
            .ok_or(StoreError::NotFound("blockchain_transaction"))?;
        tx.status = update.status;
        tx.confirmations = update.confirmations;
        tx.block_number = update.block_number;
        tx.block_hash = update.block_hash;
        tx.gas_used = update.gas_used;
        tx.status_message = update.status_message;
        tx.updated_at = now;
        if update.status == TransactionStatus::Confirmed {
            tx.confirmed_at = Some(now);
        }
        Ok(tx.clone())
    }

    async fn complete_order(&self, order_id: &str) -> Result<Order, Self::Error> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let order = t
            .orders
            .get_mut(order_id)
            .ok_or(StoreError::NotFound("order"))?;
        order.status = OrderStatus::Completed;
        order.allocated_at = Some(now);
        order.expires_at = Some(Order::compute_expiry(now, order.duration_days));
        order.updated_at = now;
        Ok(order.clone())
    }

    async fn fail_order_blockchain(
        &self,
        order_id: &str,
        message: &str,
    ) -> Result<Order, Self::Error> {
        let mut t = self.tables.lock().await;
        let order = t
            .orders
            .get_mut(order_id)
            .ok_or(StoreError::NotFound("order"))?;
        order.status = OrderStatus::BlockchainFailed;
        order.status_message = Some(message.to_string());
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn get_transaction(&self, tx_id: &str) -> Result<Option<BlockchainTransaction>, Self::Error> {
        Ok(self.tables.lock().await.transactions.get(tx_id).cloned())
    }

    async fn list_transactions_for_sweep(&self) -> Result<Vec<BlockchainTransaction>, Self::Error> {
        let t = self.tables.lock().await;
        Ok(t.transactions
            .values()
            .filter(|tx| {
                matches!(
                    tx.status,
                    TransactionStatus::Submitted | TransactionStatus::Confirming
                )
            })
            .cloned()
            .collect())
    }

    async fn list_orders_needing_dispatch(&self) -> Result<Vec<Order>, Self::Error> {
        let t = self.tables.lock().await;
        Ok(t.orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::PaymentCompleted
                    && !t
                        .transactions
                        .values()
                        .any(|tx| tx.order_id == o.id && tx.status != TransactionStatus::Failed)
            })
            .cloned()
            .collect())
    }

    async fn record_sync_log(&self, log: ProviderSyncLog) -> Result<(), Self::Error> {
        self.tables.lock().await.sync_logs.push(log);
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.tables.lock().await.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), Self::Error> {
        self.tables
            .lock()
            .await
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.into(),
            email: email.into(),
            wallet_address: None,
            processor_customer_id: None,
            created_at: Utc::now(),
        }
    }

    fn order_and_payment(status: OrderStatus) -> (Order, Payment) {
        let now = Utc::now();
        let order = Order {
            id: "o1".into(),
            order_number: String::new(),
            user_id: "u1".into(),
            provider_id: "p1".into(),
            plan_id: "plan1".into(),
            size_gb: 1,
            size_bytes: 1 << 30,
            duration_days: 180,
            price_cents: 99,
            status,
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
            id: "pay1".into(),
            order_id: "o1".into(),
            user_id: "u1".into(),
            amount_cents: 99,
            currency: "usd".into(),
            processor_payment_intent_id: None,
            processor_session_id: Some("sess1".into()),
            status: PaymentStatus::Pending,
            idempotency_key: None,
            processed_at: None,
            last_processor_error: None,
            created_at: now,
            updated_at: now,
        };
        (order, payment)
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = InMemoryStore::new();
        store.create_user(user("u1", "a@example.com")).await.unwrap();
        let err = store.create_user(user("u2", "A@Example.com")).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict("users.email"));
    }

    #[tokio::test]
    async fn cancel_order_requires_pending_payment() {
        let store = InMemoryStore::new();
        let (order, payment) = order_and_payment(OrderStatus::Completed);
        store.create_checkout(order, payment).await.unwrap();
        let err = store.cancel_order("o1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidOrderStatus { .. }));
    }

    #[tokio::test]
    async fn webhook_success_is_idempotent() {
        let store = InMemoryStore::new();
        let (order, payment) = order_and_payment(OrderStatus::PendingPayment);
        store.create_checkout(order, payment).await.unwrap();

        let first = store
            .complete_payment_and_order("sess1", "pi_1", None)
            .await
            .unwrap();
        assert!(first.is_some());
        let order = store.get_order("o1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PaymentCompleted);

        let second = store
            .complete_payment_and_order("sess1", "pi_1", None)
            .await
            .unwrap();
        assert!(second.is_none(), "second delivery must be a no-op");
    }

    #[tokio::test]
    async fn begin_allocation_requires_payment_completed() {
        let store = InMemoryStore::new();
        let (order, payment) = order_and_payment(OrderStatus::PendingPayment);
        store.create_checkout(order, payment).await.unwrap();
        let err = store.begin_allocation("o1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidOrderStatus { .. }));
    }

    #[tokio::test]
    async fn retry_respects_max_retries() {
        let store = InMemoryStore::new();
        store
            .create_provider(Provider {
                id: "p1".into(),
                slug: "fil".into(),
                network: NetworkType::Mainnet,
                chain_id: Some(314),
                status: ProviderStatus::Active,
                enabled: true,
            })
            .await
            .unwrap();
        let (order, payment) = order_and_payment(OrderStatus::PaymentCompleted);
        store.create_checkout(order, payment).await.unwrap();
        let tx = store.begin_allocation("o1").await.unwrap();
        assert_eq!(tx.network, NetworkType::Mainnet);
        assert_eq!(tx.chain_id, Some(314));
        store.start_processing("o1").await.unwrap();
        store.record_submission_failure(&tx.id, "boom").await.unwrap();

        for _ in 0..DEFAULT_MAX_RETRIES {
            store.retry_transaction(&tx.id).await.unwrap();
            store.record_submission_failure(&tx.id, "boom again").await.unwrap();
        }
        let err = store.retry_transaction(&tx.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotRetryable(_)));
    }
}
