//! Rust API Gate
//!
//! Sits between an application and the third-party HTTP APIs it calls. Every call
//! is fingerprinted, answered from a persistent response cache when possible, held
//! to a per-client fixed-window rate limit when not, and priced in provider credits.
//! State lives in Redis or an in-process backend.

pub mod backend;
pub mod client;
pub mod config;
pub mod credits;
pub mod error;
pub mod fingerprint;
pub mod gate;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod store;
pub mod transport;
pub mod utils;

// Re-export main types
pub use client::{BasicClient, Client, Method, Params};
pub use config::{ClientSettings, GateConfig, StorageFailurePolicy};
pub use credits::{CreditTable, ScrapeOptions};
pub use error::{GateError, Result};
pub use gate::{CacheScope, CallOptions, CallResult, RequestGate};
pub use limiter::RateLimiter;
pub use store::ResponseStore;
