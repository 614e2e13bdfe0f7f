//! Storage seams: the durable store and the hot cache + priority index.
//!
//! The durable store exclusively owns the authoritative copy of every rule.
//! The cache owns a derivable replica keyed by ID plus, per L1 bucket key, a
//! sorted set of candidate rule IDs scored by priority. Only the repository
//! is allowed to coordinate the two.

mod memory;
mod redis;
mod sql;

use async_trait::async_trait;

pub use memory::{MemoryRuleCache, MemoryRuleStore};
pub use redis::RedisRuleCache;
pub use sql::SqlRuleStore;

use crate::error::Result;
use crate::rule::{MockRule, RuleFilter};

/// CRUD persistence of rules keyed by ID, plus filtered listing.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert or replace. A uniqueness collision on `(name, protocol)` is
    /// `AlreadyExists`; any other failure is `StoreUnavailable`. The write
    /// is transactional: no partial rule is ever observable.
    async fn save(&self, rule: &MockRule) -> Result<()>;

    /// Fetch by ID, `NotFound` when absent.
    async fn get(&self, id: &str) -> Result<MockRule>;

    /// Idempotent delete; deleting a missing rule is success.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Fetch the subset of `ids` that exists; ordering is not guaranteed.
    async fn batch_get(&self, ids: &[String]) -> Result<Vec<MockRule>>;

    /// All rules matching the filter.
    async fn list(&self, filter: &RuleFilter) -> Result<Vec<MockRule>>;

    /// Page through rules matching the filter. Pages are 1-based and
    /// `size` must be positive. Returns `(rules, total)`.
    async fn list_paged(
        &self,
        filter: &RuleFilter,
        page: u64,
        size: u64,
    ) -> Result<(Vec<MockRule>, u64)>;
}

/// Per-rule object cache plus the per-L1-key sorted priority index.
///
/// The index stores only IDs, never rule bodies, keeping hot buckets small
/// and collisions harmless.
#[async_trait]
pub trait RuleCache: Send + Sync {
    /// Fetch a cached rule, `NotFound` when absent.
    async fn get_rule(&self, id: &str) -> Result<MockRule>;

    /// Write the object cache entry for a rule. No TTL; invalidation is
    /// explicit via `delete_rule`.
    async fn set_rule(&self, rule: &MockRule) -> Result<()>;

    async fn delete_rule(&self, id: &str) -> Result<()>;

    /// Candidate rule IDs for a bucket, highest priority first. A missing
    /// key is an empty list, not an error.
    async fn get_index(&self, l1: &str) -> Result<Vec<String>>;

    /// Insert `(id, priority)` into the bucket's sorted set, reading the
    /// priority from the object cache. Fails if the rule is not cached:
    /// callers must ensure `set_rule` precedes `set_index`.
    async fn set_index(&self, l1: &str, id: &str) -> Result<()>;

    /// Upsert the rule's `(id, priority)` into its own bucket.
    async fn update_index(&self, rule: &MockRule) -> Result<()>;

    /// Remove the rule's ID from its bucket.
    async fn remove_from_index(&self, rule: &MockRule) -> Result<()>;
}
