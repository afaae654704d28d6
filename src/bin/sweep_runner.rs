//! One-shot runner for the periodic sweeps: a cron-invoked binary rather
//! than a long-lived process. The orchestrator is a library; scheduling it
//! is this binary's job, not its own.

use std::sync::Arc;

use storage_order_orchestrator::adapter::Registry;
use storage_order_orchestrator::adapters::api::ApiAdapter;
use storage_order_orchestrator::config::OrchestratorConfig;
use storage_order_orchestrator::orchestrator::Orchestrator;
use storage_order_orchestrator::poller::{run_confirmation_sweep, run_dispatch_sweep, run_provider_sync};
use storage_order_orchestrator::store::InMemoryStore;
use storage_order_orchestrator::time::DefaultTime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::initialize_from_args()?;

    // A real deployment wires a persistent `Store` impl here; the in-memory
    // one only exists so this binary has something to sweep against when
    // run standalone (e.g. in CI or a smoke test).
    let store = Arc::new(InMemoryStore::new());

    let mut registry = Registry::new();
    for (slug, base_url) in &config.provider_rpc_urls {
        registry.register(Box::new(ApiAdapter::new(
            slug.clone(),
            base_url.clone(),
            config.processor_secret_key.clone(),
            config.provider_explorer_urls.get(slug).cloned(),
        )));
    }
    let registry = Arc::new(registry);

    let orchestrator = Orchestrator::new(store.clone(), registry.clone(), DefaultTime);

    tracing::info!("running provider sync sweep");
    if let Err(e) = run_provider_sync(store.as_ref(), registry.as_ref()).await {
        tracing::error!(error = %e, "provider sync sweep failed");
    }

    tracing::info!("running confirmation sweep");
    match run_confirmation_sweep(store.as_ref(), registry.as_ref()).await {
        Ok(touched) => tracing::info!(touched, "confirmation sweep complete"),
        Err(e) => tracing::error!(error = %e, "confirmation sweep failed"),
    }

    tracing::info!("running dispatch sweep");
    match run_dispatch_sweep(store.as_ref(), &orchestrator).await {
        Ok(dispatched) => tracing::info!(dispatched, "dispatch sweep complete"),
        Err(e) => tracing::error!(error = %e, "dispatch sweep failed"),
    }

    Ok(())
}
