use clap::Parser;
use std::collections::HashMap;
use std::fmt::Debug;

#[derive(Clone, Parser)]
#[command(name = "storage_orchestrator_config")]
#[command(about = "Configuration for the storage order orchestrator")]
pub struct EnvCliConfig {
    /// Connection string for the serializable relational store.
    #[arg(long, env)]
    pub database_url: Option<String>,

    /// Payment processor secret key (server-side API calls).
    #[arg(long, env)]
    pub processor_secret_key: Option<String>,

    /// Payment processor publishable key (handed to hosted checkout pages).
    #[arg(long, env)]
    pub processor_publishable_key: Option<String>,

    /// Shared secret used to verify webhook signatures.
    #[arg(long, env)]
    pub processor_webhook_secret: Option<String>,

    /// Hot wallet private key used to sign EVM submissions. Absent means
    /// EVM adapters initialize in a degraded, non-submitting state unless
    /// `allow_mock_submission` is also set.
    #[arg(long, env)]
    pub hot_wallet_private_key: Option<String>,

    /// Explicit opt-in for adapters to fabricate pseudo transaction hashes
    /// when no hot wallet is configured. Must never default to true.
    #[arg(long, env)]
    pub allow_mock_submission: Option<bool>,

    #[arg(long, env)]
    pub rate_limit_window_ms: Option<u64>,

    #[arg(long, env)]
    pub rate_limit_max_requests: Option<u32>,

    #[arg(long, env)]
    pub provider_sync_cron: Option<String>,

    #[arg(long, env)]
    pub tx_confirmation_cron: Option<String>,

    #[arg(long, env)]
    pub cors_origins: Option<String>,

    /// Session signing secret, must be at least 32 characters.
    #[arg(long, env)]
    pub session_secret: Option<String>,

    /// "development" enables verbose error `details`; anything else
    /// (including absent) is treated as production.
    #[arg(long, env)]
    pub node_env: Option<String>,

    /// Comma-separated `slug=url` pairs of per-provider RPC endpoints, e.g.
    /// `fil=https://rpc.example/fil,akash=https://rpc.example/akash`.
    #[arg(long, env)]
    pub provider_rpc_urls: Option<String>,

    /// Comma-separated `slug=url` pairs of per-provider block-explorer base
    /// URLs, same format as `provider_rpc_urls`.
    #[arg(long, env)]
    pub provider_explorer_urls: Option<String>,
}

#[derive(Clone)]
pub struct OrchestratorConfig {
    pub database_url: String,
    pub processor_secret_key: String,
    pub processor_publishable_key: String,
    pub processor_webhook_secret: String,
    pub hot_wallet_private_key: Option<String>,
    pub allow_mock_submission: bool,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub provider_sync_cron: String,
    pub tx_confirmation_cron: String,
    pub cors_origins: Vec<String>,
    pub session_secret: String,
    pub is_development: bool,
    /// Per-provider RPC/explorer URL overrides, keyed by slug.
    pub provider_rpc_urls: HashMap<String, String>,
    pub provider_explorer_urls: HashMap<String, String>,
}

impl Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("database_url", &self.database_url)
            .field(
                "hot_wallet_private_key",
                &self.hot_wallet_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("allow_mock_submission", &self.allow_mock_submission)
            .field("rate_limit_window_ms", &self.rate_limit_window_ms)
            .field("rate_limit_max_requests", &self.rate_limit_max_requests)
            .field("provider_sync_cron", &self.provider_sync_cron)
            .field("tx_confirmation_cron", &self.tx_confirmation_cron)
            .field("cors_origins", &self.cors_origins)
            .field("is_development", &self.is_development)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("SESSION_SECRET must be at least 32 characters")]
    SessionSecretTooShort,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 100;
const DEFAULT_PROVIDER_SYNC_CRON: &str = "0 0 */6 * * *";
const DEFAULT_TX_CONFIRMATION_CRON: &str = "0 */2 * * * *";

fn parse_slug_url_pairs(raw: Option<String>) -> HashMap<String, String> {
    raw.map(|s| {
        s.split(',')
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(slug, url)| (slug.trim().to_string(), url.trim().to_string()))
            .collect()
    })
    .unwrap_or_default()
}

impl OrchestratorConfig {
    pub fn initialize_from_args() -> Result<Self> {
        Self::initialize(EnvCliConfig::parse())
    }

    pub fn initialize(env: EnvCliConfig) -> Result<Self> {
        let database_url =
            env.database_url.ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let processor_secret_key = env
            .processor_secret_key
            .ok_or(ConfigError::Missing("PROCESSOR_SECRET_KEY"))?;
        let processor_publishable_key = env
            .processor_publishable_key
            .ok_or(ConfigError::Missing("PROCESSOR_PUBLISHABLE_KEY"))?;
        let processor_webhook_secret = env
            .processor_webhook_secret
            .ok_or(ConfigError::Missing("PROCESSOR_WEBHOOK_SECRET"))?;
        let session_secret = env
            .session_secret
            .ok_or(ConfigError::Missing("SESSION_SECRET"))?;
        if session_secret.len() < 32 {
            return Err(ConfigError::SessionSecretTooShort);
        }

        let cors_origins = env
            .cors_origins
            .map(|s| s.split(',').map(|o| o.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(Self {
            database_url,
            processor_secret_key,
            processor_publishable_key,
            processor_webhook_secret,
            hot_wallet_private_key: env.hot_wallet_private_key,
            allow_mock_submission: env.allow_mock_submission.unwrap_or(false),
            rate_limit_window_ms: env
                .rate_limit_window_ms
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_MS),
            rate_limit_max_requests: env
                .rate_limit_max_requests
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS),
            provider_sync_cron: env
                .provider_sync_cron
                .unwrap_or_else(|| DEFAULT_PROVIDER_SYNC_CRON.to_string()),
            tx_confirmation_cron: env
                .tx_confirmation_cron
                .unwrap_or_else(|| DEFAULT_TX_CONFIRMATION_CRON.to_string()),
            cors_origins,
            session_secret,
            is_development: env.node_env.as_deref() == Some("development"),
            provider_rpc_urls: parse_slug_url_pairs(env.provider_rpc_urls),
            provider_explorer_urls: parse_slug_url_pairs(env.provider_explorer_urls),
        })
    }
}
