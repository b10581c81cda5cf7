//! C1: Shared State Store.
//!
//! An abstraction over KV, hash, sorted-set, list, and pub/sub primitives,
//! plus prefix enumeration for administrative sweeps. The engine depends
//! only on the `StateStore` trait; `sled_store` supplies the default,
//! embedded, durable backend so a single node needs no external broker.

mod sled_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;

pub use sled_store::SledStateStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// A single member of a sorted set: a serialized value paired with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // KV
    async fn kv_set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;
    async fn kv_get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    async fn kv_delete(&self, key: &str) -> StoreResult<()>;

    // Hash
    async fn hash_set(&self, key: &str, fields: &[(&str, &[u8])], ttl: Option<Duration>) -> StoreResult<()>;
    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<Vec<(String, Vec<u8>)>>>;
    async fn hash_delete(&self, key: &str) -> StoreResult<()>;

    // Sorted set
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<ScoredMember>>;
    async fn zrange_by_rank(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<ScoredMember>>;
    async fn zcard(&self, key: &str) -> StoreResult<usize>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<usize>;

    // List (FIFO, push to front like the reference bus buffers)
    async fn list_push_front(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;
    async fn list_trim(&self, key: &str, max_len: usize) -> StoreResult<()>;
    async fn list_range(&self, key: &str, limit: usize) -> StoreResult<Vec<Vec<u8>>>;
    async fn list_len(&self, key: &str) -> StoreResult<usize>;
    /// Pops the oldest (last-pushed-front, i.e. tail) element, if any.
    async fn list_pop_back(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    // Pub/sub
    fn publish(&self, channel: &str, payload: Vec<u8>);
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>>;

    // Administrative sweeps only — never on the hot path.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}
