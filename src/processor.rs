//! Payment processor seam. A hosted-checkout payment processor is an
//! external system behind a narrow async trait: one capability set, one
//! concrete HTTP-backed implementation, a hand-rolled mock for tests.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::Mutex;

use crate::error::{Error, ErrorKind, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub order_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    pub session_url: String,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
}

#[async_trait]
pub trait PaymentProcessor: Debug + Send + Sync {
    async fn create_checkout_session(&self, request: CreateSessionRequest)
        -> Result<CheckoutSession>;

    /// Re-fetches a previously created session by id, for the checkout
    /// initiator's idempotent-resume path. `Ok(None)` means the session has
    /// expired or no longer exists upstream — the caller falls back to
    /// asking for a fresh idempotency key rather than treating it as a
    /// hard error.
    async fn get_checkout_session(&self, session_id: &str) -> Result<Option<CheckoutSession>>;

    /// Verifies a webhook payload against its signature header, using the
    /// shared secret configured out of band. Must reject, never best-effort
    /// accept, a payload that fails verification.
    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> Result<()>;
}

/// Talks to the hosted checkout processor's own REST API.
#[derive(Debug)]
pub struct HostedCheckoutProcessor {
    secret_key: String,
    webhook_secret: String,
    api_base_url: String,
    client: Client,
}

impl HostedCheckoutProcessor {
    pub fn new(secret_key: String, webhook_secret: String, api_base_url: String) -> Self {
        Self {
            secret_key,
            webhook_secret,
            api_base_url,
            client: Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: String,
    payment_intent: Option<String>,
    customer: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[async_trait]
impl PaymentProcessor for HostedCheckoutProcessor {
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CheckoutSession> {
        let mut builder = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base_url.trim_end_matches('/')))
            .bearer_auth(&self.secret_key)
            .form(&[
                ("amount", request.amount_cents.to_string()),
                ("currency", request.currency.clone()),
                ("customer_email", request.customer_email.clone()),
                ("client_reference_id", request.order_id.clone()),
            ]);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let res = builder
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::ExternalServiceError, e.to_string()))?;
        if !res.status().is_success() {
            return Err(Error::new(
                ErrorKind::PaymentError,
                format!("processor returned status {}", res.status()),
            ));
        }
        let body: SessionResponse = res
            .json()
            .await
            .map_err(|e| Error::new(ErrorKind::ExternalServiceError, e.to_string()))?;

        Ok(CheckoutSession {
            session_id: body.id,
            session_url: body.url,
            payment_intent_id: body.payment_intent,
            customer_id: body.customer,
        })
    }

    async fn get_checkout_session(&self, session_id: &str) -> Result<Option<CheckoutSession>> {
        let res = self
            .client
            .get(format!(
                "{}/v1/checkout/sessions/{session_id}",
                self.api_base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::ExternalServiceError, e.to_string()))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(Error::new(
                ErrorKind::PaymentError,
                format!("processor returned status {}", res.status()),
            ));
        }
        let body: SessionResponse = res
            .json()
            .await
            .map_err(|e| Error::new(ErrorKind::ExternalServiceError, e.to_string()))?;
        if body.status.as_deref() == Some("expired") {
            return Ok(None);
        }

        Ok(Some(CheckoutSession {
            session_id: body.id,
            session_url: body.url,
            payment_intent_id: body.payment_intent,
            customer_id: body.customer,
        }))
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> Result<()> {
        let expected = signature_header
            .strip_prefix("sha256=")
            .ok_or_else(|| Error::new(ErrorKind::InvalidSignature, "missing sha256= prefix"))?;
        let expected = hex::decode(expected)
            .map_err(|_| Error::new(ErrorKind::InvalidSignature, "signature is not valid hex"))?;

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| Error::new(ErrorKind::Internal, "webhook secret has invalid length"))?;
        mac.update(payload);
        mac.verify_slice(&expected)
            .map_err(|_| Error::new(ErrorKind::InvalidSignature, "signature mismatch"))
    }
}

/// A hand-rolled processor double for tests. Signature verification accepts
/// any payload whose signature header equals `"test-signature"`, so tests
/// can assert the rejection path without computing real HMACs everywhere.
#[derive(Debug, Default)]
pub struct MockPaymentProcessor {
    pub sessions: Mutex<Vec<CreateSessionRequest>>,
    issued: Mutex<HashMap<String, CheckoutSession>>,
    /// Session ids in this set are reported as expired by `get_checkout_session`.
    pub expired: Mutex<Vec<String>>,
}

impl MockPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a previously issued session as expired upstream, for tests
    /// exercising the idempotent-resume path.
    pub async fn expire_session(&self, session_id: &str) {
        self.expired.lock().await.push(session_id.to_string());
    }
}

#[async_trait]
impl PaymentProcessor for MockPaymentProcessor {
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CheckoutSession> {
        let session_id = format!("sess_mock_{}", self.sessions.lock().await.len() + 1);
        let session_url = format!("https://checkout.mock/session/{session_id}");
        let customer_id = Some(format!("cust_mock_{}", request.customer_email));
        self.sessions.lock().await.push(request);
        let session = CheckoutSession {
            session_id,
            session_url,
            payment_intent_id: None,
            customer_id,
        };
        self.issued
            .lock()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get_checkout_session(&self, session_id: &str) -> Result<Option<CheckoutSession>> {
        if self.expired.lock().await.iter().any(|id| id == session_id) {
            return Ok(None);
        }
        Ok(self.issued.lock().await.get(session_id).cloned())
    }

    fn verify_webhook_signature(&self, _payload: &[u8], signature_header: &str) -> Result<()> {
        if signature_header == "test-signature" {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::InvalidSignature, "signature mismatch"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_processor_rejects_missing_prefix() {
        let processor = HostedCheckoutProcessor::new(
            "sk".into(),
            "whsec".into(),
            "https://api.processor.example".into(),
        );
        let err = processor
            .verify_webhook_signature(b"{}", "v1=deadbeef")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[test]
    fn hosted_processor_accepts_matching_hmac() {
        let processor = HostedCheckoutProcessor::new(
            "sk".into(),
            "whsec".into(),
            "https://api.processor.example".into(),
        );
        let mut mac = HmacSha256::new_from_slice(b"whsec").unwrap();
        mac.update(b"{\"type\":\"checkout.session.completed\"}");
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");
        assert!(processor
            .verify_webhook_signature(b"{\"type\":\"checkout.session.completed\"}", &header)
            .is_ok());
    }

    #[tokio::test]
    async fn mock_processor_rejects_wrong_signature() {
        let processor = MockPaymentProcessor::new();
        assert!(processor.verify_webhook_signature(b"{}", "wrong").is_err());
        assert!(processor
            .verify_webhook_signature(b"{}", "test-signature")
            .is_ok());
    }
}
