//! Read-through/write-through repository over the durable store and the
//! hot cache + priority index.
//!
//! The durable store is authoritative; the cache and index converge
//! asynchronously after each mutation. Writes go through the store
//! synchronously (retried), then a bounded worker pool repairs the cache
//! and index with its own retry policies on a detached deadline; an
//! originating client disconnecting must not cancel the repair. Reads are
//! cache-first with coalesced durable fallbacks, so a thundering herd on a
//! cold key produces a single upstream lookup.

pub mod retry;
pub mod singleflight;
pub mod worker_pool;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RepoConfig;
use crate::error::{EngineError, Result};
use crate::rule::{MockRule, RequestInfo, RuleFilter};
use crate::storage::{RuleCache, RuleStore};
use retry::{retry, RetryPolicy};
use singleflight::Group;
use worker_pool::WorkerPool;

pub struct RuleRepository {
    store: Arc<dyn RuleStore>,
    cache: Arc<dyn RuleCache>,
    save_retry: RetryPolicy,
    cache_retry: RetryPolicy,
    index_retry: RetryPolicy,
    repair_deadline: Duration,
    pool: WorkerPool,
    /// Coalesces `find_rule_{id}` and `find_rule_{L1}` flights.
    rule_calls: Group<MockRule>,
    list_calls: Group<(Vec<MockRule>, u64)>,
    save_calls: Group<MockRule>,
    delete_calls: Group<()>,
}

impl RuleRepository {
    pub fn new(store: Arc<dyn RuleStore>, cache: Arc<dyn RuleCache>, config: &RepoConfig) -> Self {
        Self {
            store,
            cache,
            save_retry: RetryPolicy::new(config.save_retry_count, config.save_retry_delay()),
            cache_retry: RetryPolicy::new(config.cache_retry_count, config.cache_retry_delay()),
            index_retry: RetryPolicy::new(config.index_retry_count, config.index_retry_delay()),
            repair_deadline: config.repair_deadline(),
            pool: WorkerPool::new(config.worker_pool_size),
            rule_calls: Group::new(),
            list_calls: Group::new(),
            save_calls: Group::new(),
            delete_calls: Group::new(),
        }
    }

    /// Persist a rule. The derived `l1_match_index` and bookkeeping fields
    /// are recomputed here, and no other code may write them. Returns once the
    /// durable write commits; cache and index freshness is eventual.
    pub async fn save(&self, rule: MockRule) -> Result<MockRule> {
        let mut rule = rule;
        rule.ensure_id();
        rule.prepare_for_save();
        rule.validate()?;

        let key = format!("save_rule_{}", rule.id);
        self.save_calls
            .run(&key, || async {
                retry(self.save_retry, || self.store.save(&rule)).await?;
                self.spawn_save_repair(rule.clone());
                Ok(rule.clone())
            })
            .await
    }

    /// Delete a rule and tear down its cache and index entries. Deleting a
    /// rule that is already gone is success.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = format!("delete_rule_{id}");
        self.delete_calls
            .run(&key, || async {
                // The rule is needed to locate its L1 bucket before it goes.
                let rule = match self.store.get(id).await {
                    Ok(rule) => Some(rule),
                    Err(EngineError::NotFound(_)) => None,
                    Err(e) => return Err(e),
                };

                self.store.delete(id).await?;

                match rule {
                    Some(rule) => self.spawn_delete_repair(rule),
                    None => self.spawn_cache_eviction(id.to_string()),
                }
                Ok(())
            })
            .await
    }

    /// Fetch a rule by ID: cache first, then a coalesced durable fetch that
    /// repopulates the cache. Cache write failures do not fail the read.
    pub async fn find(&self, id: &str) -> Result<MockRule> {
        match self.cache.get_rule(id).await {
            Ok(rule) => {
                debug!(rule_id = id, "rule found in cache");
                return Ok(rule);
            }
            Err(EngineError::NotFound(_)) => {}
            Err(e) => debug!(rule_id = id, error = %e, "cache read failed, falling back"),
        }

        let key = format!("find_rule_{id}");
        self.rule_calls
            .run(&key, || async {
                let rule = self.store.get(id).await?;
                if let Err(e) = retry(self.cache_retry, || self.cache.set_rule(&rule)).await {
                    warn!(rule_id = id, error = %e, "failed to repopulate rule cache");
                }
                Ok(rule)
            })
            .await
    }

    /// Candidate rules for an L1 bucket.
    ///
    /// Sorted-set path: read the index, then the object cache per ID;
    /// cache-missing IDs are batch-read from the store and repopulated
    /// asynchronously. Empty index: fall back to a durable listing and
    /// repopulate both cache and index asynchronously.
    pub async fn get_index_rule(&self, l1: &str) -> Result<Vec<MockRule>> {
        let ids = match self.cache.get_index(l1).await {
            Ok(ids) => ids,
            Err(e) => {
                debug!(l1, error = %e, "index read failed, falling back to store");
                Vec::new()
            }
        };

        if ids.is_empty() {
            debug!(l1, "index cache miss, listing from store");
            let mut rules = self.store.list(&RuleFilter::by_l1_index(l1)).await?;
            // The sorted set would have handed these back ordered; match it.
            rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
            if !rules.is_empty() {
                self.spawn_index_repopulation(rules.clone());
            }
            return Ok(rules);
        }

        let mut rules = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in &ids {
            match self.cache.get_rule(id).await {
                Ok(rule) => rules.push(rule),
                Err(_) => missing.push(id.clone()),
            }
        }

        if !missing.is_empty() {
            debug!(l1, missing = missing.len(), "batch-reading cache misses from store");
            let db_rules = self.store.batch_get(&missing).await?;
            if !db_rules.is_empty() {
                self.spawn_cache_repopulation(db_rules.clone());
                rules.extend(db_rules);
            }
        }

        Ok(rules)
    }

    /// Find the winning rule for a request. The whole lookup is coalesced
    /// by L1 key so identical concurrent requests share one flight.
    pub async fn find_best_match(&self, req: &dyn RequestInfo) -> Result<MockRule> {
        let l1 = req.match_index();
        let key = format!("find_rule_{l1}");
        self.rule_calls
            .run(&key, || async {
                debug!(l1 = %l1, "finding best match rule");
                let rules = self.get_index_rule(&l1).await?;
                rules
                    .into_iter()
                    .find(|rule| rule.is_match(req))
                    .ok_or(EngineError::NoMatch)
            })
            .await
    }

    /// Page through rules, coalesced per filter digest.
    pub async fn list_rules_paged(
        &self,
        filter: &RuleFilter,
        page: u64,
        size: u64,
    ) -> Result<(Vec<MockRule>, u64)> {
        if page == 0 || size == 0 {
            return Err(EngineError::Validation(
                "page must be >= 1 and size must be positive".into(),
            ));
        }
        let key = format!("list_rules_{}", filter.digest(page, size));
        self.list_calls
            .run(&key, || self.store.list_paged(filter, page, size))
            .await
    }

    /// All rules matching a filter, straight from the durable store.
    pub async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<MockRule>> {
        self.store.list(filter).await
    }

    // ===== async repair =====

    fn spawn_save_repair(&self, rule: MockRule) {
        let cache = self.cache.clone();
        let cache_retry = self.cache_retry;
        let index_retry = self.index_retry;
        let deadline = self.repair_deadline;
        self.submit_repair("save", async move {
            let id = rule.id.clone();
            let work = async {
                if let Err(e) = retry(cache_retry, || cache.set_rule(&rule)).await {
                    warn!(rule_id = %id, error = %e, "async cache update failed");
                }
                if let Err(e) = retry(index_retry, || cache.update_index(&rule)).await {
                    warn!(rule_id = %id, error = %e, "async index update failed");
                }
            };
            if timeout(deadline, work).await.is_err() {
                warn!(rule_id = %id, "save repair timed out");
            }
        });
    }

    fn spawn_delete_repair(&self, rule: MockRule) {
        let cache = self.cache.clone();
        let cache_retry = self.cache_retry;
        let index_retry = self.index_retry;
        let deadline = self.repair_deadline;
        self.submit_repair("delete", async move {
            let id = rule.id.clone();
            let work = async {
                if let Err(e) = retry(cache_retry, || cache.delete_rule(&rule.id)).await {
                    warn!(rule_id = %id, error = %e, "async cache eviction failed");
                }
                if let Err(e) = retry(index_retry, || cache.remove_from_index(&rule)).await {
                    warn!(rule_id = %id, error = %e, "async index removal failed");
                }
            };
            if timeout(deadline, work).await.is_err() {
                warn!(rule_id = %id, "delete repair timed out");
            }
        });
    }

    fn spawn_cache_eviction(&self, id: String) {
        let cache = self.cache.clone();
        let cache_retry = self.cache_retry;
        let deadline = self.repair_deadline;
        self.submit_repair("evict", async move {
            let work = async {
                if let Err(e) = retry(cache_retry, || cache.delete_rule(&id)).await {
                    warn!(rule_id = %id, error = %e, "async cache eviction failed");
                }
            };
            let _ = timeout(deadline, work).await;
        });
    }

    /// Repopulate cache and index for rules recovered via the durable
    /// listing fallback.
    fn spawn_index_repopulation(&self, rules: Vec<MockRule>) {
        let cache = self.cache.clone();
        let cache_retry = self.cache_retry;
        let deadline = self.repair_deadline;
        self.submit_repair("index-repopulate", async move {
            let work = retry(cache_retry, || async {
                for rule in &rules {
                    cache.set_rule(rule).await?;
                    cache.update_index(rule).await?;
                }
                Ok(())
            });
            match timeout(deadline, work).await {
                Ok(Err(e)) => warn!(error = %e, "failed to repopulate index from store"),
                Err(_) => warn!("index repopulation timed out"),
                Ok(Ok(())) => {}
            }
        });
    }

    /// Repopulate the object cache for rules batch-read around index holes.
    fn spawn_cache_repopulation(&self, rules: Vec<MockRule>) {
        let cache = self.cache.clone();
        let cache_retry = self.cache_retry;
        let deadline = self.repair_deadline;
        self.submit_repair("cache-repopulate", async move {
            let work = retry(cache_retry, || async {
                for rule in &rules {
                    cache.set_rule(rule).await?;
                }
                Ok(())
            });
            match timeout(deadline, work).await {
                Ok(Err(e)) => warn!(error = %e, "failed to repopulate rule cache"),
                Err(_) => warn!("cache repopulation timed out"),
                Ok(Ok(())) => {}
            }
        });
    }

    fn submit_repair<F>(&self, kind: &'static str, job: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = self.pool.submit(job) {
            // Dropped on the floor by design: the store is authoritative and
            // the next read repairs the skew.
            warn!(kind, error = %e, "failed to submit repair job");
        }
    }
}
