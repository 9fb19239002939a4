//! Traffic-control core for the payrail API.
//!
//! Everything multi-tenant request handling hangs off: the task-local request
//! context, tenant resolution from API keys, the store-backed sliding-window
//! rate limiter, the cache layer with stampede protection, and the row-level
//! security session binding.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod rate_limit;
pub mod rls;
pub mod tenant;
