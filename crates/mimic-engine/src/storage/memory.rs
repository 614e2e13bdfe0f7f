//! In-process store and cache.
//!
//! Used by the test suite and by single-instance deployments that do not
//! want external services. Behavior mirrors the SQL/Redis implementations,
//! with one deliberate difference: equal-priority index entries are ordered
//! by rule ID ascending so matching is deterministic.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::rule::{MockRule, RuleFilter};
use crate::storage::{RuleCache, RuleStore};

/// HashMap-backed durable store.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<HashMap<String, MockRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn save(&self, rule: &MockRule) -> Result<()> {
        let mut rules = self.rules.lock();
        let collision = rules.values().any(|existing| {
            existing.id != rule.id
                && existing.name == rule.name
                && existing.protocol == rule.protocol
        });
        if collision {
            return Err(EngineError::AlreadyExists {
                name: rule.name.clone(),
                protocol: rule.protocol.clone(),
            });
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<MockRule> {
        self.rules
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.rules.lock().remove(id);
        Ok(())
    }

    async fn batch_get(&self, ids: &[String]) -> Result<Vec<MockRule>> {
        let rules = self.rules.lock();
        Ok(ids.iter().filter_map(|id| rules.get(id).cloned()).collect())
    }

    async fn list(&self, filter: &RuleFilter) -> Result<Vec<MockRule>> {
        let rules = self.rules.lock();
        let mut matched: Vec<MockRule> = rules
            .values()
            .filter(|rule| filter.matches(rule))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn list_paged(
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
        let all = self.list(filter).await?;
        let total = all.len() as u64;
        let start = ((page - 1) * size) as usize;
        let rules = all.into_iter().skip(start).take(size as usize).collect();
        Ok((rules, total))
    }
}

/// HashMap-backed object cache and sorted priority index.
#[derive(Default)]
pub struct MemoryRuleCache {
    rules: Mutex<HashMap<String, MockRule>>,
    /// L1 key -> (priority, rule id), kept sorted highest priority first.
    index: Mutex<HashMap<String, Vec<(i64, String)>>>,
}

impl MemoryRuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached object and index entry, as an external cache flush
    /// would.
    pub fn flush(&self) {
        self.rules.lock().clear();
        self.index.lock().clear();
    }

    fn upsert_entry(bucket: &mut Vec<(i64, String)>, priority: i64, id: &str) {
        bucket.retain(|(_, existing)| existing != id);
        bucket.push((priority, id.to_string()));
        // Highest priority first; ties by rule ID ascending for determinism.
        bucket.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    }
}

#[async_trait]
impl RuleCache for MemoryRuleCache {
    async fn get_rule(&self, id: &str) -> Result<MockRule> {
        self.rules
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn set_rule(&self, rule: &MockRule) -> Result<()> {
        if rule.id.is_empty() {
            return Err(EngineError::Validation("rule id must not be empty".into()));
        }
        self.rules.lock().insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<()> {
        self.rules.lock().remove(id);
        Ok(())
    }

    async fn get_index(&self, l1: &str) -> Result<Vec<String>> {
        Ok(self
            .index
            .lock()
            .get(l1)
            .map(|bucket| bucket.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default())
    }

    async fn set_index(&self, l1: &str, id: &str) -> Result<()> {
        let rule = self.get_rule(id).await?;
        let mut index = self.index.lock();
        let bucket = index.entry(l1.to_string()).or_default();
        Self::upsert_entry(bucket, rule.priority, id);
        Ok(())
    }

    async fn update_index(&self, rule: &MockRule) -> Result<()> {
        self.set_index(&rule.l1_index_key(), &rule.id).await
    }

    async fn remove_from_index(&self, rule: &MockRule) -> Result<()> {
        let mut index = self.index.lock();
        if let Some(bucket) = index.get_mut(&rule.l1_index_key()) {
            bucket.retain(|(_, id)| id != &rule.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::rule::RuleStatus;

    fn rule(id: &str, name: &str, priority: i64) -> MockRule {
        let mut rule = MockRule {
            id: id.into(),
            name: name.into(),
            protocol: "http".into(),
            match_config: serde_json::from_value(json!({
                "logical": "AND",
                "conditions": [{"type": "path", "operator": "eq", "value": "/api/users"}]
            }))
            .unwrap(),
            action_config: serde_json::from_value(json!({
                "type": "response",
                "config": {"statusCode": 200}
            }))
            .unwrap(),
            priority,
            status: RuleStatus::Active,
            method: "GET".into(),
            original_path: "/api/users".into(),
            ..Default::default()
        };
        rule.prepare_for_save();
        rule
    }

    #[tokio::test]
    async fn store_save_get_delete() {
        let store = MemoryRuleStore::new();
        store.save(&rule("r1", "one", 1)).await.unwrap();

        let fetched = store.get("r1").await.unwrap();
        assert_eq!(fetched.name, "one");

        store.delete("r1").await.unwrap();
        assert!(matches!(store.get("r1").await, Err(EngineError::NotFound(_))));
        // Deleting again is still success.
        store.delete("r1").await.unwrap();
    }

    #[tokio::test]
    async fn store_rejects_name_protocol_collision() {
        let store = MemoryRuleStore::new();
        store.save(&rule("r1", "dup", 1)).await.unwrap();

        let err = store.save(&rule("r2", "dup", 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists { .. }));

        // Replacing the same ID is fine.
        store.save(&rule("r1", "dup", 9)).await.unwrap();
        assert_eq!(store.get("r1").await.unwrap().priority, 9);
    }

    #[tokio::test]
    async fn store_batch_get_returns_existing_subset() {
        let store = MemoryRuleStore::new();
        store.save(&rule("r1", "one", 1)).await.unwrap();
        store.save(&rule("r2", "two", 2)).await.unwrap();

        let got = store
            .batch_get(&["r1".into(), "missing".into(), "r2".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn store_list_filters_and_pages() {
        let store = MemoryRuleStore::new();
        for i in 0..5 {
            store.save(&rule(&format!("r{i}"), &format!("n{i}"), i)).await.unwrap();
        }
        let mut draft = rule("r9", "draft", 0);
        draft.status = RuleStatus::Draft;
        store.save(&draft).await.unwrap();

        let l1 = RuleFilter::by_l1_index("http_get_/api/users");
        assert_eq!(store.list(&l1).await.unwrap().len(), 6);

        let enabled = RuleFilter {
            is_enabled: Some(true),
            ..Default::default()
        };
        assert_eq!(store.list(&enabled).await.unwrap().len(), 5);

        let (page, total) = store.list_paged(&l1, 2, 4).await.unwrap();
        assert_eq!(total, 6);
        assert_eq!(page.len(), 2);

        assert!(store.list_paged(&l1, 0, 4).await.is_err());
        assert!(store.list_paged(&l1, 1, 0).await.is_err());
    }

    #[tokio::test]
    async fn cache_index_orders_by_priority_then_id() {
        let cache = MemoryRuleCache::new();
        for (id, priority) in [("b", 5), ("a", 5), ("c", 10), ("d", 1)] {
            cache.set_rule(&rule(id, id, priority)).await.unwrap();
            cache.set_index("bucket", id).await.unwrap();
        }

        let ids = cache.get_index("bucket").await.unwrap();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
    }

    #[tokio::test]
    async fn cache_set_index_requires_cached_rule() {
        let cache = MemoryRuleCache::new();
        assert!(matches!(
            cache.set_index("bucket", "ghost").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cache_update_index_moves_priority() {
        let cache = MemoryRuleCache::new();
        let mut r = rule("r1", "one", 1);
        cache.set_rule(&r).await.unwrap();
        cache.update_index(&r).await.unwrap();

        r.priority = 50;
        cache.set_rule(&r).await.unwrap();
        cache.update_index(&r).await.unwrap();

        let bucket = r.l1_index_key();
        let ids = cache.get_index(&bucket).await.unwrap();
        assert_eq!(ids, vec!["r1"]); // no duplicate entries after upsert

        cache.remove_from_index(&r).await.unwrap();
        assert!(cache.get_index(&bucket).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_index_key_is_empty_not_error() {
        let cache = MemoryRuleCache::new();
        assert!(cache.get_index("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_clears_everything() {
        let cache = MemoryRuleCache::new();
        let r = rule("r1", "one", 1);
        cache.set_rule(&r).await.unwrap();
        cache.update_index(&r).await.unwrap();

        cache.flush();
        assert!(matches!(
            cache.get_rule("r1").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(cache.get_index(&r.l1_index_key()).await.unwrap().is_empty());
    }
}
