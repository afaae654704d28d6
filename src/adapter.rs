//! Provider adapter contract and the process-wide registry.
//!
//! Every storage backend — EVM chain or plain HTTP API — is driven through
//! one trait so the orchestrator never branches on provider identity: a
//! narrow async trait, one concrete impl per real backend, nothing upstream
//! cares which.

use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::domain::{Cents, PlanStatus};
use crate::error::Result;

/// One plan observation as reported by a provider's own catalog API.
#[derive(Debug, Clone)]
pub struct RemotePlan {
    pub external_plan_id: String,
    pub size_gb: u32,
    pub size_bytes: u64,
    pub duration_days: u32,
    pub price_cents: Cents,
    pub price_native: Option<String>,
    pub currency: String,
    pub status: PlanStatus,
}

#[derive(Debug, Clone)]
pub struct StorageTransactionRequest {
    pub order_id: String,
    pub plan_external_id: String,
    pub size_bytes: u64,
    pub duration_days: u32,
    pub price_native: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageTransactionOutcome {
    pub tx_hash: String,
    pub confirmations: u32,
    pub storage_id: Option<String>,
    pub storage_endpoint: Option<String>,
    pub storage_metadata: Option<Json>,
    pub raw_response: Option<Json>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTxState {
    Pending,
    Confirming,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RemoteTxProgress {
    pub state: RemoteTxState,
    pub confirmations: u32,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub gas_used: Option<String>,
    pub message: Option<String>,
}

#[async_trait]
pub trait Adapter: Debug + Send + Sync {
    fn slug(&self) -> &str;

    /// Establishes whatever connection the adapter needs (RPC client, HTTP
    /// client credentials). Called once, at registry construction time.
    async fn initialize(&self) -> Result<()>;

    /// Cheap liveness probe, used by the checkout initiator to keep
    /// unhealthy providers out of the plan list.
    async fn is_available(&self) -> bool;

    /// Cheap, possibly-cached read of the provider's plan catalog. Good
    /// enough for the checkout initiator, which just needs to validate a
    /// plan still exists.
    async fn get_available_plans(&self) -> Result<Vec<RemotePlan>>;

    /// Hits the provider's catalog source fresh. The caller (the provider
    /// sync sweep) is responsible for reconciling the result against the
    /// store — the adapter itself never touches persistence.
    async fn sync_plans(&self) -> Result<Vec<RemotePlan>>;

    async fn execute_storage_transaction(
        &self,
        request: StorageTransactionRequest,
    ) -> Result<StorageTransactionOutcome>;

    async fn check_transaction_status(&self, tx_hash: &str) -> Result<RemoteTxProgress>;

    async fn get_transaction_explorer_url(&self, tx_hash: &str) -> Option<String>;
}

/// The process-wide adapter table, built once at startup and shared behind
/// an `Arc` rather than reached for through a global lookup.
#[derive(Debug, Default)]
pub struct Registry {
    adapters: HashMap<String, Box<dyn Adapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Box<dyn Adapter>) {
        self.adapters.insert(adapter.slug().to_string(), adapter);
    }

    /// Looks up an adapter by slug, `None` if nothing is registered under it.
    pub fn get_or_none(&self, slug: &str) -> Option<&dyn Adapter> {
        self.adapters.get(slug).map(|a| a.as_ref())
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn Adapter> {
        self.adapters.values().map(|a| a.as_ref())
    }

    /// Adapters currently reporting themselves available, checked live rather
    /// than from a cached status.
    pub async fn available(&self) -> Vec<&dyn Adapter> {
        let mut out = Vec::new();
        for adapter in self.adapters.values() {
            if adapter.is_available().await {
                out.push(adapter.as_ref());
            }
        }
        out
    }

    /// Runs `sync_plans` against every registered adapter. A single
    /// provider's failure never aborts the others' sync — one backend's
    /// outage must not stall the rest.
    pub async fn sync_all(&self) -> Vec<(String, Result<Vec<RemotePlan>>)> {
        let mut results = Vec::with_capacity(self.adapters.len());
        for adapter in self.adapters.values() {
            let outcome = adapter.sync_plans().await;
            results.push((adapter.slug().to_string(), outcome));
        }
        results
    }
}
