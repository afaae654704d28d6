//! API-style adapter (Storj, Lighthouse, Akash slugs): a bare `reqwest`
//! client, a typed JSON response, a status-code check. No chain client, no
//! signing; the backend is just an HTTP API this adapter calls on the
//! storage aggregator's behalf.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value as Json;

use crate::adapter::{
    Adapter, RemotePlan, RemoteTxProgress, RemoteTxState, StorageTransactionOutcome,
    StorageTransactionRequest,
};
use crate::domain::PlanStatus;
use crate::error::Error;
use crate::error::Result;

#[derive(Debug)]
pub struct ApiAdapter {
    slug: String,
    base_url: String,
    api_key: String,
    explorer_base_url: Option<String>,
    client: Client,
}

impl ApiAdapter {
    pub fn new(
        slug: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        explorer_base_url: Option<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            explorer_base_url,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    plan_id: String,
    size_gb: u32,
    duration_days: u32,
    price_cents: i64,
    available: bool,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_reference: String,
    storage_id: Option<String>,
    storage_endpoint: Option<String>,
    #[serde(default)]
    metadata: Option<Json>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    status: String,
    confirmations: u32,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl Adapter for ApiAdapter {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.client
            .head(self.url("v1/health"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map(|res| res.status().is_success())
            .unwrap_or(false)
    }

    async fn get_available_plans(&self) -> Result<Vec<RemotePlan>> {
        self.sync_plans().await
    }

    async fn sync_plans(&self) -> Result<Vec<RemotePlan>> {
        let res = self
            .client
            .get(self.url("v1/plans"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;
        if res.status() != StatusCode::OK {
            return Err(Error::from_provider(
                &self.slug,
                format!("unexpected status code {}", res.status()),
            ));
        }
        let plans: Vec<PlanResponse> = res
            .json()
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;

        Ok(plans
            .into_iter()
            .map(|p| RemotePlan {
                external_plan_id: p.plan_id,
                size_gb: p.size_gb,
                size_bytes: (p.size_gb as u64) * 1_073_741_824,
                duration_days: p.duration_days,
                price_cents: p.price_cents,
                price_native: None,
                currency: "usd".to_string(),
                status: if p.available {
                    PlanStatus::Available
                } else {
                    PlanStatus::Unavailable
                },
            })
            .collect())
    }

    async fn execute_storage_transaction(
        &self,
        request: StorageTransactionRequest,
    ) -> Result<StorageTransactionOutcome> {
        let body = serde_json::json!({
            "order_id": request.order_id,
            "plan_id": request.plan_external_id,
            "size_bytes": request.size_bytes,
            "duration_days": request.duration_days,
        });

        let res = self
            .client
            .post(self.url("v1/orders"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;
        if res.status() != StatusCode::OK && res.status() != StatusCode::CREATED {
            return Err(Error::from_provider(
                &self.slug,
                format!("unexpected status code {}", res.status()),
            ));
        }
        let raw: Json = res
            .json()
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;
        let order: OrderResponse = serde_json::from_value(raw.clone())
            .map_err(|e| Error::from_provider(&self.slug, format!("malformed response: {e}")))?;

        Ok(StorageTransactionOutcome {
            tx_hash: order.order_reference,
            confirmations: 0,
            storage_id: order.storage_id,
            storage_endpoint: order.storage_endpoint,
            storage_metadata: order.metadata,
            raw_response: Some(raw),
        })
    }

    async fn check_transaction_status(&self, tx_hash: &str) -> Result<RemoteTxProgress> {
        let res = self
            .client
            .get(self.url(&format!("v1/orders/{tx_hash}/status")))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteTxProgress {
                state: RemoteTxState::Pending,
                confirmations: 0,
                block_number: None,
                block_hash: None,
                gas_used: None,
                message: None,
            });
        }
        if res.status() != StatusCode::OK {
            return Err(Error::from_provider(
                &self.slug,
                format!("unexpected status code {}", res.status()),
            ));
        }
        let status: OrderStatusResponse = res
            .json()
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;

        let state = match status.status.as_str() {
            "pending" => RemoteTxState::Pending,
            "confirming" => RemoteTxState::Confirming,
            "confirmed" | "completed" => RemoteTxState::Confirmed,
            "failed" | "rejected" => RemoteTxState::Failed,
            other => {
                return Err(Error::from_provider(
                    &self.slug,
                    format!("unrecognized order status '{other}'"),
                ))
            }
        };

        Ok(RemoteTxProgress {
            state,
            confirmations: status.confirmations,
            block_number: None,
            block_hash: None,
            gas_used: None,
            message: status.message,
        })
    }

    async fn get_transaction_explorer_url(&self, tx_hash: &str) -> Option<String> {
        self.explorer_base_url
            .as_ref()
            .map(|base| format!("{}/orders/{}", base.trim_end_matches('/'), tx_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path_without_double_slashes() {
        let adapter = ApiAdapter::new("storj", "https://api.storj.example/", "key", None);
        assert_eq!(adapter.url("/v1/plans"), "https://api.storj.example/v1/plans");
    }
}
