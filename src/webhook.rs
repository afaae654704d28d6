//! Webhook Ingestor: verifies the payment processor's webhook signature,
//! then applies one of a fixed set of event transitions. Once a payload's
//! signature has been verified, this always answers with success — an
//! unrecognized or already-applied event is a no-op, not a 5xx, so the
//! processor never retries a webhook we've already handled.
//!
//! Depends on [`AllocationScheduler`] rather than the orchestrator type
//! directly: the orchestrator implements this trait, so the module graph
//! has exactly one edge between the two, not a cycle.

use async_trait::async_trait;
use serde_json::Value as Json;
use tracing::{instrument, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::processor::PaymentProcessor;
use crate::store::Store;

#[async_trait]
pub trait AllocationScheduler: Send + Sync {
    /// Kicks off allocation for an order whose payment just completed.
    /// Implementations return once the work is scheduled (e.g. spawned),
    /// not once it finishes.
    async fn schedule_allocation(&self, order_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebhookEvent {
    CheckoutSessionCompleted,
    CheckoutSessionExpired,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    Unrecognized,
}

impl WebhookEvent {
    fn from_type(raw: &str) -> Self {
        match raw {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "checkout.session.expired" => Self::CheckoutSessionExpired,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentIntentFailed,
            _ => Self::Unrecognized,
        }
    }
}

#[instrument(skip(store, processor, scheduler, payload), fields(bytes = payload.len()))]
pub async fn ingest_webhook<S: Store, P: PaymentProcessor, A: AllocationScheduler>(
    store: &S,
    processor: &P,
    scheduler: &A,
    payload: &[u8],
    signature_header: &str,
) -> Result<()> {
    processor.verify_webhook_signature(payload, signature_header)?;

    let event: Json = serde_json::from_slice(payload)
        .map_err(|e| Error::validation(format!("malformed webhook payload: {e}")))?;
    let event_type = event.get("type").and_then(Json::as_str).unwrap_or_default();
    let object = event.get("data").and_then(|d| d.get("object"));

    match WebhookEvent::from_type(event_type) {
        WebhookEvent::CheckoutSessionCompleted => {
            let session_id = str_field(object, "id");
            let payment_intent_id = str_field(object, "payment_intent");
            let metadata = object.and_then(|o| o.get("metadata")).cloned();
            let (Some(session_id), Some(payment_intent_id)) = (session_id, payment_intent_id)
            else {
                warn!(event_type, "checkout.session.completed missing session or payment_intent id");
                return Ok(());
            };
            match store
                .complete_payment_and_order(&session_id, &payment_intent_id, metadata)
                .await
            {
                Ok(Some((order, _payment))) => {
                    if order.status == crate::domain::OrderStatus::PaymentCompleted {
                        scheduler.schedule_allocation(&order.id).await;
                    }
                }
                Ok(None) => { /* already processed; idempotent no-op */ }
                Err(e) => warn!(error = %e, "failed to apply checkout.session.completed"),
            }
        }
        WebhookEvent::CheckoutSessionExpired => {
            if let Some(session_id) = str_field(object, "id") {
                if let Err(e) = store
                    .expire_payment_and_order(&session_id, "checkout session expired")
                    .await
                {
                    warn!(error = %e, "failed to apply checkout.session.expired");
                }
            }
        }
        WebhookEvent::PaymentIntentSucceeded => {
            if let Some(payment_intent_id) = str_field(object, "id") {
                if let Err(e) = store.mark_payment_intent_succeeded(&payment_intent_id).await {
                    warn!(error = %e, "failed to apply payment_intent.succeeded");
                }
            }
        }
        WebhookEvent::PaymentIntentFailed => {
            let payment_intent_id = str_field(object, "id");
            let message = object
                .and_then(|o| o.get("last_payment_error"))
                .and_then(|e| e.get("message"))
                .and_then(Json::as_str)
                .unwrap_or("payment failed")
                .to_string();
            if let Some(payment_intent_id) = payment_intent_id {
                if let Err(e) = store.fail_payment_and_order(&payment_intent_id, &message).await {
                    warn!(error = %e, "failed to apply payment_intent.payment_failed");
                }
            }
        }
        WebhookEvent::Unrecognized => {
            warn!(event_type, "unrecognized webhook event type; ignoring");
        }
    }

    Ok(())
}

fn str_field(object: Option<&Json>, field: &str) -> Option<String> {
    object?.get(field)?.as_str().map(str::to_string)
}

/// Surfaces a signature failure distinctly from "verified but malformed",
/// so the HTTP boundary can answer 400 either way but log them apart.
pub fn is_signature_error(err: &Error) -> bool {
    err.kind == ErrorKind::InvalidSignature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::MockPaymentProcessor;
    use crate::store::InMemoryStore;

    struct NoopScheduler;

    #[async_trait]
    impl AllocationScheduler for NoopScheduler {
        async fn schedule_allocation(&self, _order_id: &str) {}
    }

    #[tokio::test]
    async fn rejects_invalid_signature() {
        let store = InMemoryStore::new();
        let processor = MockPaymentProcessor::new();
        let scheduler = NoopScheduler;
        let err = ingest_webhook(&store, &processor, &scheduler, b"{}", "bad-signature")
            .await
            .unwrap_err();
        assert!(is_signature_error(&err));
    }

    #[tokio::test]
    async fn unrecognized_event_is_a_no_op_not_an_error() {
        let store = InMemoryStore::new();
        let processor = MockPaymentProcessor::new();
        let scheduler = NoopScheduler;
        let payload = br#"{"type":"customer.created","data":{"object":{}}}"#;
        let result = ingest_webhook(&store, &processor, &scheduler, payload, "test-signature").await;
        assert!(result.is_ok());
    }
}
