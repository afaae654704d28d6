//! Core entities of the order lifecycle: users, providers, storage plans,
//! orders, payments and the blockchain transactions that back them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub type Id = String;
pub type Cents = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Testnet,
    Mainnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    Active,
    Inactive,
    Maintenance,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    Available,
    Unavailable,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    /// Live payments block a second non-terminal payment from existing on
    /// the same order.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Succeeded
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Failed | PaymentStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Submitted,
    Confirming,
    Confirmed,
    Failed,
    Retrying,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Confirmed | TransactionStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingPayment,
    PaymentProcessing,
    PaymentCompleted,
    PaymentFailed,
    Cancelled,
    BlockchainPending,
    BlockchainProcessing,
    BlockchainFailed,
    Completed,
    Refunded,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Refunded
                | OrderStatus::Cancelled
                | OrderStatus::PaymentFailed
                | OrderStatus::BlockchainFailed
        )
    }

    /// The directed edges of the order lifecycle state machine. Every
    /// transition the orchestrator performs must be one of these edges —
    /// status never regresses to an already-passed state.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (PendingPayment, PaymentProcessing)
                | (PendingPayment, Cancelled)
                | (PaymentProcessing, PaymentCompleted)
                | (PaymentProcessing, PaymentFailed)
                | (PendingPayment, PaymentCompleted)
                | (PendingPayment, PaymentFailed)
                | (PaymentCompleted, BlockchainPending)
                | (BlockchainPending, BlockchainProcessing)
                | (BlockchainProcessing, Completed)
                | (BlockchainProcessing, BlockchainFailed)
                | (BlockchainFailed, BlockchainPending)
                | (Completed, Refunded)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub wallet_address: Option<String>,
    pub processor_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Id,
    pub slug: String,
    pub network: NetworkType,
    pub chain_id: Option<u64>,
    pub status: ProviderStatus,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePlan {
    pub id: Id,
    pub provider_id: Id,
    pub external_plan_id: String,
    pub size_gb: u32,
    pub size_bytes: u64,
    pub duration_days: u32,
    pub price_cents: Cents,
    pub price_native: Option<String>,
    pub currency: String,
    pub status: PlanStatus,
    pub active: bool,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Id,
    pub order_number: String,
    pub user_id: Id,
    pub provider_id: Id,
    pub plan_id: Id,

    // Snapshotted at creation time; immutable thereafter regardless of
    // later plan mutations.
    pub size_gb: u32,
    pub size_bytes: u64,
    pub duration_days: u32,
    pub price_cents: Cents,

    pub status: OrderStatus,
    pub status_message: Option<String>,
    pub idempotency_key: Option<String>,

    pub storage_id: Option<String>,
    pub storage_endpoint: Option<String>,
    pub storage_metadata: Option<Json>,

    pub paid_at: Option<DateTime<Utc>>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Expiry is derived once, at confirmation time, from the snapshotted
    /// duration — set only when the allocation transaction confirms, never
    /// recomputed from a plan's current duration afterward.
    pub fn compute_expiry(allocated_at: DateTime<Utc>, duration_days: u32) -> DateTime<Utc> {
        allocated_at + ChronoDuration::days(duration_days as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Id,
    pub order_id: Id,
    pub user_id: Id,
    pub amount_cents: Cents,
    pub currency: String,
    pub processor_payment_intent_id: Option<String>,
    pub processor_session_id: Option<String>,
    pub status: PaymentStatus,
    pub idempotency_key: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_processor_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainTransaction {
    pub id: Id,
    pub order_id: Id,
    pub provider_id: Id,
    pub network: NetworkType,
    pub chain_id: Option<u64>,
    pub tx_hash: Option<String>,
    pub status: TransactionStatus,
    pub status_message: Option<String>,
    pub confirmations: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub gas_used: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub raw_response: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderSyncStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSyncLog {
    pub id: Id,
    pub provider_id: Id,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub plans_added: u32,
    pub plans_updated: u32,
    pub plans_removed: u32,
    pub errors: Vec<String>,
    pub status: ProviderSyncStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_liveness() {
        assert!(PaymentStatus::Pending.is_live());
        assert!(PaymentStatus::Processing.is_live());
        assert!(PaymentStatus::Succeeded.is_live());
        assert!(!PaymentStatus::Failed.is_live());
        assert!(!PaymentStatus::Cancelled.is_live());
    }

    #[test]
    fn order_state_machine_forbids_backward_transitions() {
        assert!(OrderStatus::PendingPayment.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::PendingPayment));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::PaymentCompleted));
        assert!(OrderStatus::Completed.can_transition_to(OrderStatus::Refunded));
    }

    #[test]
    fn expiry_is_duration_days_after_allocation() {
        let allocated = Utc::now();
        let expires = Order::compute_expiry(allocated, 180);
        assert_eq!((expires - allocated).num_days(), 180);
    }
}
