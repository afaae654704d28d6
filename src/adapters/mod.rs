//! Concrete provider adapters, grouped by the two backend shapes this crate
//! supports: chains driven directly over an EVM RPC, and aggregators
//! fronted by a plain HTTP API.

pub mod api;
pub mod evm;
