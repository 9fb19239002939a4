//! External key-value store backends.
//!
//! The traffic-control core (rate limiting, caching, stampede locks) talks to
//! a shared store through the [`KeyValueStore`] trait so that every process
//! instance sees the same counters and cache entries. Two backends:
//!
//! - [`RedisStore`]: the production backend. All multi-step operations run as
//!   atomic pipelines, which is what makes the rate limiter correct across
//!   horizontally-scaled instances.
//! - [`MemoryStore`]: single-process backend for tests and store-less
//!   development. Same observable semantics, no cross-process sharing.

pub mod glob;
pub mod kv;
pub mod memory;
pub mod redis_store;

pub use kv::{KeyValueStore, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
