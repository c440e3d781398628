//! Causal analysis engine for port impact studies.
//!
//! LAYERS (leaves first):
//!   panel → matching → estimator → orchestrator → store
//!
//! RULES:
//!   - Only `store` executes SQL.
//!   - Statistical indeterminacy is a null coefficient with warnings,
//!     never an error.
//!   - All randomness (synthetic panels only) flows through `rng`.

pub mod analysis;
pub mod config;
pub mod error;
pub mod estimator;
pub mod matching;
pub mod orchestrator;
pub mod panel;
pub mod poll;
pub mod request;
pub mod rng;
pub mod simulate;
pub mod store;
pub mod types;
