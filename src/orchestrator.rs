//! Allocation Orchestrator: drives a paid order through adapter submission
//! and hands the resulting transaction off to the confirmation poller. A
//! narrow state-carrying struct generic over the store and the provider
//! registry, one entry point that submits then confirms,
//! `#[tracing::instrument]` on every hop.
//!
//! Implements [`crate::webhook::AllocationScheduler`] rather than being
//! depended on by `webhook`, so the module graph has exactly one edge
//! between the two.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use crate::adapter::{Registry, StorageTransactionRequest};
use crate::domain::{TransactionStatus, DEFAULT_MAX_RETRIES};
use crate::error::{Error, ErrorKind, Result};
use crate::poller::ConfirmationPoller;
use crate::store::{Store, SubmissionSuccess};
use crate::time::Time;
use crate::webhook::AllocationScheduler;

/// Submits a paid order's allocation and, on success, detaches a poller for
/// it. Cheap to clone: everything it owns is already an `Arc` or `Copy`.
#[derive(Debug)]
pub struct Orchestrator<S: Store, T: Time> {
    store: Arc<S>,
    registry: Arc<Registry>,
    time: T,
}

impl<S: Store, T: Time> Clone for Orchestrator<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            time: self.time.clone(),
        }
    }
}

impl<S, T> Orchestrator<S, T>
where
    S: Store + Send + Sync + 'static,
    S::Error: std::fmt::Display + Send + Sync + 'static,
    T: Time + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, registry: Arc<Registry>, time: T) -> Self {
        Self { store, registry, time }
    }

    /// Runs the submission algorithm to completion (submit, or fail the
    /// order) and, on success, spawns the confirmation poller.
    /// Idempotent with respect to redelivered webhooks: if a non-FAILED
    /// transaction already exists for the order, this is a no-op.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn run_allocation(&self, order_id: &str) {
        if let Err(e) = self.try_run_allocation(order_id).await {
            error!(error = %e, "allocation run failed");
        }
    }

    async fn try_run_allocation(&self, order_id: &str) -> Result<()> {
        if let Some(existing) = self
            .store
            .find_non_failed_transaction(order_id)
            .await
            .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
        {
            info!(tx_id = %existing.id, "allocation already in flight; skipping resubmission");
            self.spawn_poller_if_pending(existing.id);
            return Ok(());
        }

        let tx = self
            .store
            .begin_allocation(order_id)
            .await
            .map_err(|e| Error::new(ErrorKind::InvalidOrderStatus, e.to_string()))?;
        self.submit(order_id, &tx.id).await
    }

    /// Re-enters the orchestrator for a FAILED transaction that has just
    /// been retried: `retry_transaction` flips the order back to
    /// BLOCKCHAIN_PENDING and re-enters submission here.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn retry_allocation(&self, order_id: &str, tx_id: &str) {
        if let Err(e) = self.submit(order_id, tx_id).await {
            error!(error = %e, "allocation retry failed");
        }
    }

    async fn submit(&self, order_id: &str, tx_id: &str) -> Result<()> {
        let order = self
            .store
            .start_processing(order_id)
            .await
            .map_err(|e| Error::new(ErrorKind::InvalidOrderStatus, e.to_string()))?;

        let provider = self
            .store
            .get_provider(&order.provider_id)
            .await
            .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
            .ok_or_else(|| Error::not_found("provider"))?;
        let plan = self
            .store
            .get_plan(&order.plan_id)
            .await
            .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
            .ok_or_else(|| Error::not_found("plan"))?;
        let adapter = self
            .registry
            .get(&provider.slug)
            .ok_or_else(|| Error::not_found(format!("adapter for '{}'", provider.slug)))?;

        let outcome = adapter
            .execute_storage_transaction(StorageTransactionRequest {
                order_id: order.id.clone(),
                plan_external_id: plan.external_plan_id.clone(),
                size_bytes: order.size_bytes,
                duration_days: order.duration_days,
                price_native: plan.price_native.clone(),
            })
            .await;

        match outcome {
            Ok(outcome) => {
                self.store
                    .record_submission_success(
                        tx_id,
                        SubmissionSuccess {
                            tx_hash: outcome.tx_hash,
                            status: TransactionStatus::Submitted,
                            storage_id: outcome.storage_id,
                            storage_endpoint: outcome.storage_endpoint,
                            storage_metadata: outcome.storage_metadata,
                            raw_response: outcome.raw_response,
                        },
                    )
                    .await
                    .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
                info!(tx_id, "submission succeeded; handing off to confirmation poller");
                self.spawn_poller_if_pending(tx_id.to_string());
                Ok(())
            }
            Err(e) => {
                warn!(tx_id, error = %e, "submission failed");
                self.store
                    .record_submission_failure(tx_id, &e.to_string())
                    .await
                    .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
                Err(Error::new(ErrorKind::TransactionFailed, e.to_string()))
            }
        }
    }

    /// Detaches the confirmation poller for a transaction without awaiting
    /// it. The periodic sweep in `poller.rs` is the correctness backstop if
    /// this task never runs or the process restarts mid-poll.
    fn spawn_poller_if_pending(&self, tx_id: String) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let time = self.time.clone();
        tokio::spawn(async move {
            let poller = ConfirmationPoller::new(store, registry, time);
            poller.run(&tx_id).await;
        });
    }

    /// Operator-facing retry: `retry_count < max_retries` and
    /// `status == FAILED` are enforced by the store itself; this just
    /// re-enters submission once the store accepts the retry.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn retry_transaction(&self, tx_id: &str) -> Result<()> {
        let tx = self
            .store
            .retry_transaction(tx_id)
            .await
            .map_err(|e| Error::new(ErrorKind::MaxRetries, e.to_string()))?;
        info!(
            retry_count = tx.retry_count,
            max_retries = DEFAULT_MAX_RETRIES,
            "retrying allocation"
        );
        self.retry_allocation(&tx.order_id, &tx.id).await;
        Ok(())
    }
}

#[async_trait]
impl<S, T> AllocationScheduler for Orchestrator<S, T>
where
    S: Store + Send + Sync + 'static,
    S::Error: std::fmt::Display + Send + Sync + 'static,
    T: Time + Send + Sync + 'static,
{
    async fn schedule_allocation(&self, order_id: &str) {
        let this = self.clone();
        let order_id = order_id.to_string();
        tokio::spawn(async move { this.run_allocation(&order_id).await });
    }
}
