//! EVM-style adapter (Filecoin, Greenfield slugs): build a typed EIP-1559
//! request, estimate gas, sign and send. Confirmation polling itself is the
//! Confirmation Poller's job; this adapter only reports where a given hash
//! currently stands.

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Eip1559TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::warn;

use crate::adapter::{
    Adapter, RemotePlan, RemoteTxProgress, RemoteTxState, StorageTransactionOutcome,
    StorageTransactionRequest,
};
use crate::domain::PlanStatus;
use crate::error::{Error, ErrorKind, Result};

/// Confirmations required before the poller may call a transaction settled.
const CONFIRMATION_THRESHOLD: u64 = 5;

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// One fixed-catalog plan this provider sells. Real EVM storage markets
/// (Filecoin deals, Greenfield buckets) quote a small, fairly static set of
/// size/duration combinations rather than a live pricing API, so the
/// catalog is supplied at construction instead of fetched per adapter call.
#[derive(Debug, Clone)]
pub struct EvmPlanCatalogEntry {
    pub external_plan_id: String,
    pub size_gb: u32,
    pub size_bytes: u64,
    pub duration_days: u32,
    pub price_cents: i64,
    pub price_native: String,
}

#[derive(Debug)]
pub struct EvmAdapter {
    slug: String,
    chain_id: u64,
    /// The storage market's deposit/escrow address. Submitting a deal in
    /// this reference build is modeled as a value transfer to it; a real
    /// integration would encode a contract call instead.
    deposit_address: Address,
    explorer_base_url: Option<String>,
    allow_mock_submission: bool,
    catalog: Vec<EvmPlanCatalogEntry>,
    client: Option<Arc<SignerClient>>,
}

impl EvmAdapter {
    pub fn new(
        slug: impl Into<String>,
        rpc_url: &str,
        chain_id: u64,
        deposit_address: Address,
        explorer_base_url: Option<String>,
        hot_wallet_private_key: Option<&str>,
        allow_mock_submission: bool,
        catalog: Vec<EvmPlanCatalogEntry>,
    ) -> Result<Self> {
        let slug = slug.into();
        let client = match hot_wallet_private_key {
            Some(key) => {
                let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| {
                    Error::from_provider(&slug, format!("invalid RPC url: {e}"))
                })?;
                let wallet: LocalWallet = key
                    .parse()
                    .map_err(|e| Error::from_provider(&slug, format!("invalid private key: {e}")))?;
                let wallet = wallet.with_chain_id(chain_id);
                Some(Arc::new(SignerMiddleware::new(provider, wallet)))
            }
            None => None,
        };
        if client.is_none() && !allow_mock_submission {
            warn!(slug = %slug, "no hot wallet configured; adapter will report unavailable until allow_mock_submission is set or a key is provided");
        }
        Ok(Self {
            slug,
            chain_id,
            deposit_address,
            explorer_base_url,
            allow_mock_submission,
            catalog,
            client,
        })
    }

    fn remote_plans(&self) -> Vec<RemotePlan> {
        self.catalog
            .iter()
            .map(|p| RemotePlan {
                external_plan_id: p.external_plan_id.clone(),
                size_gb: p.size_gb,
                size_bytes: p.size_bytes,
                duration_days: p.duration_days,
                price_cents: p.price_cents,
                price_native: Some(p.price_native.clone()),
                currency: "native".to_string(),
                status: PlanStatus::Available,
            })
            .collect()
    }

    fn price_wei_for(&self, request: &StorageTransactionRequest) -> Result<U256> {
        let entry = self
            .catalog
            .iter()
            .find(|p| p.external_plan_id == request.plan_external_id)
            .ok_or_else(|| Error::not_found(format!("plan '{}'", request.plan_external_id)))?;
        let native = request.price_native.as_deref().unwrap_or(&entry.price_native);
        U256::from_dec_str(native)
            .map_err(|e| Error::from_provider(&self.slug, format!("invalid native price: {e}")))
    }
}

#[async_trait]
impl Adapter for EvmAdapter {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn initialize(&self) -> Result<()> {
        if let Some(client) = &self.client {
            client
                .get_block_number()
                .await
                .map_err(|e| Error::from_provider(&self.slug, e))?;
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        match &self.client {
            Some(client) => client.get_block_number().await.is_ok(),
            None => self.allow_mock_submission,
        }
    }

    async fn get_available_plans(&self) -> Result<Vec<RemotePlan>> {
        Ok(self.remote_plans())
    }

    async fn sync_plans(&self) -> Result<Vec<RemotePlan>> {
        Ok(self.remote_plans())
    }

    async fn execute_storage_transaction(
        &self,
        request: StorageTransactionRequest,
    ) -> Result<StorageTransactionOutcome> {
        let value = self.price_wei_for(&request)?;

        let client = match &self.client {
            Some(client) => client.clone(),
            None if self.allow_mock_submission => {
                let fabricated = keccak256(request.order_id.as_bytes());
                return Ok(StorageTransactionOutcome {
                    tx_hash: format!("0x{}", hex::encode(fabricated)),
                    confirmations: 0,
                    storage_id: Some(format!("{}-{}", self.slug, request.order_id)),
                    storage_endpoint: None,
                    storage_metadata: None,
                    raw_response: None,
                });
            }
            None => {
                return Err(Error::new(
                    ErrorKind::ProviderError,
                    format!("provider '{}' has no hot wallet configured", self.slug),
                ))
            }
        };

        let eip1559 = Eip1559TransactionRequest::new()
            .to(self.deposit_address)
            .value(value)
            .chain_id(self.chain_id);

        let pending = client
            .send_transaction(eip1559, None)
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;
        let tx_hash: H256 = pending.tx_hash();

        Ok(StorageTransactionOutcome {
            tx_hash: format!("{tx_hash:#x}"),
            confirmations: 0,
            storage_id: Some(format!("{}-{}", self.slug, request.order_id)),
            storage_endpoint: self.explorer_base_url.clone(),
            storage_metadata: None,
            raw_response: None,
        })
    }

    async fn check_transaction_status(&self, tx_hash: &str) -> Result<RemoteTxProgress> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::from_provider(&self.slug, "adapter has no client configured"))?;
        let hash: H256 = tx_hash
            .parse()
            .map_err(|e| Error::from_provider(&self.slug, format!("invalid tx hash: {e}")))?;

        let receipt = client
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?;

        let Some(receipt) = receipt else {
            return Ok(RemoteTxProgress {
                state: RemoteTxState::Pending,
                confirmations: 0,
                block_number: None,
                block_hash: None,
                gas_used: None,
                message: None,
            });
        };

        let reverted = receipt.status.map(|s| s.as_u64() == 0).unwrap_or(false);
        if reverted {
            return Ok(RemoteTxProgress {
                state: RemoteTxState::Failed,
                confirmations: 0,
                block_number: receipt.block_number.map(|b| b.as_u64()),
                block_hash: receipt.block_hash.map(|h| format!("{h:#x}")),
                gas_used: receipt.gas_used.map(|g| g.to_string()),
                message: Some("transaction reverted".to_string()),
            });
        }

        let tx_block = receipt
            .block_number
            .ok_or_else(|| Error::from_provider(&self.slug, "mined receipt missing block number"))?
            .as_u64();
        let current_block = client
            .get_block_number()
            .await
            .map_err(|e| Error::from_provider(&self.slug, e))?
            .as_u64();
        let confirmations = (current_block.saturating_sub(tx_block) + 1) as u32;
        let state = if confirmations as u64 >= CONFIRMATION_THRESHOLD {
            RemoteTxState::Confirmed
        } else {
            RemoteTxState::Confirming
        };

        Ok(RemoteTxProgress {
            state,
            confirmations,
            block_number: Some(tx_block),
            block_hash: receipt.block_hash.map(|h| format!("{h:#x}")),
            gas_used: receipt.gas_used.map(|g| g.to_string()),
            message: None,
        })
    }

    async fn get_transaction_explorer_url(&self, tx_hash: &str) -> Option<String> {
        self.explorer_base_url
            .as_ref()
            .map(|base| format!("{}/message/{}", base.trim_end_matches('/'), tx_hash))
    }
}
