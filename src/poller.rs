//! Confirmation Poller and its periodic sweeps: a bounded retry loop,
//! sleeping between attempts via the injected [`Time`], that stops as soon
//! as the transaction reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{Registry, RemoteTxState};
use crate::domain::{ProviderSyncLog, ProviderSyncStatus, TransactionStatus};
use crate::store::{PlanFields, Store, SyncOutcome, TransactionProgress};
use crate::time::Time;
use crate::webhook::AllocationScheduler;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_POLL_ATTEMPTS: u32 = 30;

const CONFIRMATION_SWEEP_WATERMARK_KEY: &str = "tx_confirmation_sweep:last_run_at";
const PROVIDER_SYNC_WATERMARK_KEY: &str = "provider_sync:last_run_at";

/// Records the sweep's completion time in [`SystemConfig`](crate::domain::SystemConfig)
/// so the watermark survives a process restart instead of living only in
/// scheduler memory. A failure here is logged, not propagated — losing the
/// watermark only costs an operator a little sweep-timing visibility.
async fn record_watermark<S>(store: &S, key: &str)
where
    S: Store,
    S::Error: std::fmt::Display,
{
    if let Err(e) = store.set_config(key, &chrono::Utc::now().to_rfc3339()).await {
        warn!(key, error = %e, "failed to persist sweep watermark");
    }
}

/// Polls one adapter for one transaction's status until it reaches a
/// terminal state or the attempt budget (≈5 minutes) is exhausted. Exiting
/// without a terminal state is not an error: the periodic sweep below is
/// the recovery backstop.
#[derive(Debug)]
pub struct ConfirmationPoller<S: Store, T: Time> {
    store: Arc<S>,
    registry: Arc<Registry>,
    time: T,
}

impl<S, T> ConfirmationPoller<S, T>
where
    S: Store + Send + Sync + 'static,
    S::Error: std::fmt::Display + Send + Sync + 'static,
    T: Time + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, registry: Arc<Registry>, time: T) -> Self {
        Self { store, registry, time }
    }

    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn run(&self, tx_id: &str) {
        for attempt in 0..MAX_POLL_ATTEMPTS {
            if attempt > 0 {
                self.time.sleep(POLL_INTERVAL).await;
            }
            match self.poll_once(tx_id).await {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    warn!(attempt, error = %e, "transient error polling transaction status");
                    continue;
                }
            }
        }
        info!("poll budget exhausted; leaving transaction for the periodic sweep");
    }

    /// Returns `Ok(true)` once the transaction has reached a terminal state
    /// (or has disappeared, which the sweep treats the same way).
    async fn poll_once(&self, tx_id: &str) -> Result<bool, String> {
        let Some(tx) = self
            .store
            .get_transaction(tx_id)
            .await
            .map_err(|e| e.to_string())?
        else {
            return Ok(true);
        };
        if tx.status.is_terminal() {
            return Ok(true);
        }
        let Some(tx_hash) = tx.tx_hash.clone() else {
            // Nothing has been submitted to the chain/API yet; keep waiting.
            return Ok(false);
        };
        let Some(provider) = self
            .store
            .get_provider(&tx.provider_id)
            .await
            .map_err(|e| e.to_string())?
        else {
            return Err(format!("provider '{}' missing for transaction", tx.provider_id));
        };
        let Some(adapter) = self.registry.get_or_none(&provider.slug) else {
            return Err(format!("no adapter registered for provider '{}'", provider.slug));
        };

        let progress = adapter
            .check_transaction_status(&tx_hash)
            .await
            .map_err(|e| e.to_string())?;

        apply_progress(self.store.as_ref(), &tx.id, &tx.order_id, progress)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Shared between the live poller and the sweep: writes the observed
/// progress, and on a terminal state applies the matching order transition.
async fn apply_progress<S>(
    store: &S,
    tx_id: &str,
    order_id: &str,
    progress: crate::adapter::RemoteTxProgress,
) -> Result<bool, S::Error>
where
    S: Store,
{
    let status = match progress.state {
        RemoteTxState::Pending => TransactionStatus::Submitted,
        RemoteTxState::Confirming => TransactionStatus::Confirming,
        RemoteTxState::Confirmed => TransactionStatus::Confirmed,
        RemoteTxState::Failed => TransactionStatus::Failed,
    };

    store
        .update_transaction_progress(
            tx_id,
            TransactionProgress {
                status,
                confirmations: progress.confirmations,
                block_number: progress.block_number,
                block_hash: progress.block_hash,
                gas_used: progress.gas_used,
                status_message: progress.message.clone(),
            },
        )
        .await?;

    match status {
        TransactionStatus::Confirmed => {
            store.complete_order(order_id).await?;
            info!(order_id, "order completed");
            Ok(true)
        }
        TransactionStatus::Failed => {
            let message = progress.message.unwrap_or_else(|| "transaction failed".to_string());
            store.fail_order_blockchain(order_id, &message).await?;
            warn!(order_id, "order failed on-chain");
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Sweep entry point for dropped confirmation pollers (process restart, or
/// the detached polling task simply never ran): re-applies
/// `check_transaction_status` once to every transaction still SUBMITTED or
/// CONFIRMING. This is the correctness backstop that runs regardless of
/// whether any individual poller completed.
#[instrument(skip(store, registry))]
pub async fn run_confirmation_sweep<S>(store: &S, registry: &Registry) -> Result<u32, String>
where
    S: Store,
    S::Error: std::fmt::Display,
{
    let pending = store
        .list_transactions_for_sweep()
        .await
        .map_err(|e| e.to_string())?;
    let mut touched = 0;
    for tx in pending {
        let Some(tx_hash) = tx.tx_hash.clone() else { continue };
        let Some(provider) = store
            .get_provider(&tx.provider_id)
            .await
            .map_err(|e| e.to_string())?
        else {
            warn!(tx_id = %tx.id, "provider missing for swept transaction; skipping");
            continue;
        };
        let Some(adapter) = registry.get_or_none(&provider.slug) else {
            warn!(slug = %provider.slug, "no adapter registered; skipping swept transaction");
            continue;
        };
        match adapter.check_transaction_status(&tx_hash).await {
            Ok(progress) => {
                apply_progress(store, &tx.id, &tx.order_id, progress)
                    .await
                    .map_err(|e| e.to_string())?;
                touched += 1;
            }
            Err(e) => warn!(tx_id = %tx.id, error = %e, "transient error sweeping transaction"),
        }
    }
    record_watermark(store, CONFIRMATION_SWEEP_WATERMARK_KEY).await;
    Ok(touched)
}

/// Sweep entry point for orders that completed payment but never got an
/// allocation attempt dispatched (crash between the webhook and the
/// orchestrator's detached task). Re-enters via the same
/// [`AllocationScheduler`] seam the webhook uses, so the sweep and the
/// webhook share one trigger path into the orchestrator.
#[instrument(skip(store, scheduler))]
pub async fn run_dispatch_sweep<S, A>(store: &S, scheduler: &A) -> Result<u32, String>
where
    S: Store,
    S::Error: std::fmt::Display,
    A: AllocationScheduler,
{
    let stuck = store
        .list_orders_needing_dispatch()
        .await
        .map_err(|e| e.to_string())?;
    for order in &stuck {
        scheduler.schedule_allocation(&order.id).await;
    }
    Ok(stuck.len() as u32)
}

/// Runs a provider catalog sync against every registered adapter and
/// reconciles the result into the store: added/updated plans are upserted,
/// plans the provider stopped reporting are marked UNAVAILABLE, and the
/// whole run is recorded as a [`ProviderSyncLog`].
#[instrument(skip(store, registry))]
pub async fn run_provider_sync<S>(store: &S, registry: &Registry) -> Result<(), String>
where
    S: Store,
    S::Error: std::fmt::Display,
{
    for (slug, outcome) in registry.sync_all().await {
        let Some(provider) = store
            .get_provider_by_slug(&slug)
            .await
            .map_err(|e| e.to_string())?
        else {
            warn!(slug, "adapter registered for unknown provider; skipping sync log");
            continue;
        };
        let started_at = chrono::Utc::now();

        let mut log = ProviderSyncLog {
            id: Uuid::new_v4().to_string(),
            provider_id: provider.id.clone(),
            started_at,
            finished_at: None,
            plans_added: 0,
            plans_updated: 0,
            plans_removed: 0,
            errors: Vec::new(),
            status: ProviderSyncStatus::Running,
        };

        match outcome {
            Ok(plans) => {
                let mut seen_ids = Vec::with_capacity(plans.len());
                for plan in plans {
                    seen_ids.push(plan.external_plan_id.clone());
                    let fields = PlanFields {
                        size_gb: plan.size_gb,
                        size_bytes: plan.size_bytes,
                        duration_days: plan.duration_days,
                        price_cents: plan.price_cents,
                        price_native: plan.price_native,
                        currency: plan.currency,
                        status: plan.status,
                    };
                    match store
                        .upsert_synced_plan(&provider.id, &plan.external_plan_id, fields)
                        .await
                    {
                        Ok(SyncOutcome::Added) => log.plans_added += 1,
                        Ok(SyncOutcome::Updated) => log.plans_updated += 1,
                        Ok(SyncOutcome::Unchanged) => {}
                        Err(e) => log.errors.push(e.to_string()),
                    }
                }
                match store
                    .mark_missing_plans_unavailable(&provider.id, &seen_ids)
                    .await
                {
                    Ok(removed) => log.plans_removed = removed,
                    Err(e) => log.errors.push(e.to_string()),
                }
                log.status = if log.errors.is_empty() {
                    ProviderSyncStatus::Succeeded
                } else {
                    ProviderSyncStatus::Failed
                };
            }
            Err(e) => {
                warn!(slug, error = %e, "provider sync fetch failed");
                log.errors.push(e.to_string());
                log.status = ProviderSyncStatus::Failed;
            }
        }

        log.finished_at = Some(chrono::Utc::now());
        store
            .record_sync_log(log)
            .await
            .map_err(|e| e.to_string())?;
    }
    record_watermark(store, PROVIDER_SYNC_WATERMARK_KEY).await;
    Ok(())
}
