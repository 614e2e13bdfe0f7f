//! Hot cache + sorted priority index on Redis.
//!
//! Two namespaces over one connection: `mock_rule:{id}` holds the
//! JSON-serialized rule (no TTL, explicit invalidation), and each L1 bucket
//! key holds a sorted set of rule IDs with the rule priority as score.
//! `ZREVRANGE` hands candidates back highest-priority first.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{EngineError, Result};
use crate::rule::MockRule;
use crate::storage::RuleCache;

const RULE_KEY_PREFIX: &str = "mock_rule:";

pub struct RedisRuleCache {
    conn: ConnectionManager,
}

impl RedisRuleCache {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| EngineError::Configuration(format!("invalid redis url: {e}")))?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(std::time::Duration::from_millis(config.connect_timeout_ms))
            .set_response_timeout(std::time::Duration::from_millis(config.response_timeout_ms));
        let conn = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(|e| EngineError::Configuration(format!("failed to connect to redis: {e}")))?;
        Ok(Self { conn })
    }

    fn rule_key(id: &str) -> String {
        format!("{RULE_KEY_PREFIX}{id}")
    }
}

fn cache_error(e: redis::RedisError) -> EngineError {
    EngineError::CacheUnavailable(e.to_string())
}

#[async_trait]
impl RuleCache for RedisRuleCache {
    async fn get_rule(&self, id: &str) -> Result<MockRule> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::rule_key(id)).await.map_err(cache_error)?;
        let Some(raw) = raw else {
            debug!(rule_id = id, "rule not found in cache");
            return Err(EngineError::NotFound(id.to_string()));
        };
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::CacheUnavailable(format!("corrupt cached rule: {e}")))
    }

    async fn set_rule(&self, rule: &MockRule) -> Result<()> {
        if rule.id.is_empty() {
            return Err(EngineError::Validation("rule id must not be empty".into()));
        }
        let raw = serde_json::to_string(rule)
            .map_err(|e| EngineError::Validation(format!("unserializable rule: {e}")))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(Self::rule_key(&rule.id), raw)
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(Self::rule_key(id)).await.map_err(cache_error)?;
        Ok(())
    }

    async fn get_index(&self, l1: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        // Highest score first; a missing key yields an empty list.
        let ids: Vec<String> = conn.zrevrange(l1, 0, -1).await.map_err(cache_error)?;
        Ok(ids)
    }

    async fn set_index(&self, l1: &str, id: &str) -> Result<()> {
        let rule = self.get_rule(id).await?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(l1, id, rule.priority)
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn update_index(&self, rule: &MockRule) -> Result<()> {
        self.set_index(&rule.l1_index_key(), &rule.id).await
    }

    async fn remove_from_index(&self, rule: &MockRule) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zrem(rule.l1_index_key(), &rule.id)
            .await
            .map_err(cache_error)?;
        Ok(())
    }
}
