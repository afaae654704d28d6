pub mod adapter;
pub mod adapters;
pub mod checkout;
pub mod config;
pub mod domain;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod processor;
pub mod store;
pub mod time;
pub mod webhook;

pub use adapter::{Adapter, Registry};
pub use checkout::{
    cancel_order, get_order_view, initiate_checkout, CheckoutRequest, CheckoutResult, OrderView,
};
pub use config::OrchestratorConfig;
pub use domain::{Order, OrderStatus, Payment, Provider, StoragePlan};
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::Orchestrator;
pub use store::{InMemoryStore, Store};
pub use webhook::{ingest_webhook, AllocationScheduler};
