//! Durable rule store on PostgreSQL.
//!
//! The `mock_rule` table is the authoritative copy of every rule. Saves are
//! transactional upserts keyed by ID; the `(name, protocol)` unique
//! constraint is surfaced as `AlreadyExists`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::config::DatabaseConfig;
use crate::error::{EngineError, Result};
use crate::rule::{MockRule, RuleFilter, RuleStatus};
use crate::storage::RuleStore;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS mock_rule (
    id              VARCHAR(64)  PRIMARY KEY,
    name            VARCHAR(128) NOT NULL,
    protocol        VARCHAR(20)  NOT NULL,
    match_config    JSONB        NOT NULL,
    action_config   JSONB        NOT NULL,
    priority        BIGINT       NOT NULL DEFAULT 0,
    status          VARCHAR(20)  NOT NULL,
    version         BIGINT       NOT NULL DEFAULT 1,
    created_at      BIGINT       NOT NULL,
    updated_at      BIGINT       NOT NULL,
    method          VARCHAR(20)  NOT NULL DEFAULT '',
    original_path   VARCHAR(255) NOT NULL DEFAULT '',
    path_pattern    VARCHAR(255) NOT NULL DEFAULT '',
    l1_match_index  VARCHAR(255) NOT NULL DEFAULT '',
    created_by      BIGINT,
    CONSTRAINT mock_rule_name_protocol_key UNIQUE (name, protocol)
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_mock_rule_protocol ON mock_rule (protocol)",
    "CREATE INDEX IF NOT EXISTS idx_mock_rule_status ON mock_rule (status)",
    "CREATE INDEX IF NOT EXISTS idx_mock_rule_l1 ON mock_rule (l1_match_index)",
];

const SELECT_COLUMNS: &str = "SELECT id, name, protocol, match_config, action_config, priority, \
     status, version, created_at, updated_at, method, original_path, path_pattern, \
     l1_match_index, created_by FROM mock_rule";

pub struct SqlRuleStore {
    pool: PgPool,
}

impl SqlRuleStore {
    /// Connect with the configured pool tuning.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns)
            .max_lifetime(Duration::from_secs(config.conn_max_lifetime_secs))
            .idle_timeout(Duration::from_secs(config.conn_max_idle_secs))
            .connect(&config.dsn)
            .await
            .map_err(|e| EngineError::Configuration(format!("failed to connect to database: {e}")))?;
        Ok(Self { pool })
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        for statement in CREATE_INDEXES {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }

    fn apply_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &RuleFilter) {
        if let Some(id) = &filter.id {
            builder.push(" AND id = ").push_bind(id.clone());
        }
        if let Some(protocol) = &filter.protocol {
            builder.push(" AND protocol = ").push_bind(protocol.clone());
        }
        if let Some(uid) = filter.created_by {
            builder.push(" AND created_by = ").push_bind(uid);
        }
        if let Some(enabled) = filter.is_enabled {
            if enabled {
                builder.push(" AND status = ").push_bind("active");
            } else {
                builder.push(" AND status <> ").push_bind("active");
            }
        }
        if let Some(fragment) = &filter.path_contains {
            builder
                .push(" AND match_config::text LIKE ")
                .push_bind(format!("%{fragment}%"));
        }
        if let Some(l1) = &filter.l1_match_index {
            builder.push(" AND l1_match_index = ").push_bind(l1.clone());
        }
    }
}

fn store_error(e: sqlx::Error) -> EngineError {
    EngineError::StoreUnavailable(e.to_string())
}

fn save_error(e: sqlx::Error, rule: &MockRule) -> EngineError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return EngineError::AlreadyExists {
                name: rule.name.clone(),
                protocol: rule.protocol.clone(),
            };
        }
    }
    store_error(e)
}

fn row_to_rule(row: &PgRow) -> Result<MockRule> {
    let status: String = row.try_get("status").map_err(store_error)?;
    let match_config: serde_json::Value = row.try_get("match_config").map_err(store_error)?;
    let action_config: serde_json::Value = row.try_get("action_config").map_err(store_error)?;

    Ok(MockRule {
        id: row.try_get("id").map_err(store_error)?,
        name: row.try_get("name").map_err(store_error)?,
        protocol: row.try_get("protocol").map_err(store_error)?,
        match_config: serde_json::from_value(match_config)
            .map_err(|e| EngineError::StoreUnavailable(format!("corrupt match_config: {e}")))?,
        action_config: serde_json::from_value(action_config)
            .map_err(|e| EngineError::StoreUnavailable(format!("corrupt action_config: {e}")))?,
        priority: row.try_get("priority").map_err(store_error)?,
        status: RuleStatus::parse(&status)?,
        version: row.try_get("version").map_err(store_error)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
        updated_at: row.try_get("updated_at").map_err(store_error)?,
        method: row.try_get("method").map_err(store_error)?,
        original_path: row.try_get("original_path").map_err(store_error)?,
        path_pattern: row.try_get("path_pattern").map_err(store_error)?,
        l1_match_index: row.try_get("l1_match_index").map_err(store_error)?,
        created_by: row.try_get("created_by").map_err(store_error)?,
    })
}

#[async_trait]
impl RuleStore for SqlRuleStore {
    async fn save(&self, rule: &MockRule) -> Result<()> {
        let match_config = serde_json::to_value(&rule.match_config)
            .map_err(|e| EngineError::Validation(format!("unserializable match config: {e}")))?;
        let action_config = serde_json::to_value(&rule.action_config)
            .map_err(|e| EngineError::Validation(format!("unserializable action config: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query(
            r#"
            INSERT INTO mock_rule (
                id, name, protocol, match_config, action_config, priority, status,
                version, created_at, updated_at, method, original_path, path_pattern,
                l1_match_index, created_by
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                protocol = EXCLUDED.protocol,
                match_config = EXCLUDED.match_config,
                action_config = EXCLUDED.action_config,
                priority = EXCLUDED.priority,
                status = EXCLUDED.status,
                version = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at,
                method = EXCLUDED.method,
                original_path = EXCLUDED.original_path,
                path_pattern = EXCLUDED.path_pattern,
                l1_match_index = EXCLUDED.l1_match_index,
                created_by = EXCLUDED.created_by
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(&rule.protocol)
        .bind(&match_config)
        .bind(&action_config)
        .bind(rule.priority)
        .bind(rule.status.as_str())
        .bind(rule.version)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .bind(&rule.method)
        .bind(&rule.original_path)
        .bind(&rule.path_pattern)
        .bind(&rule.l1_match_index)
        .bind(rule.created_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| save_error(e, rule))?;
        tx.commit().await.map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<MockRule> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        match row {
            Some(row) => row_to_rule(&row),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM mock_rule WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn batch_get(&self, ids: &[String]) -> Result<Vec<MockRule>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ANY($1)"))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.iter().map(row_to_rule).collect()
    }

    async fn list(&self, filter: &RuleFilter) -> Result<Vec<MockRule>> {
        let mut builder = QueryBuilder::new(format!("{SELECT_COLUMNS} WHERE 1=1"));
        Self::apply_filter(&mut builder, filter);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.iter().map(row_to_rule).collect()
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

        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM mock_rule WHERE 1=1");
        Self::apply_filter(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

        let mut builder = QueryBuilder::new(format!("{SELECT_COLUMNS} WHERE 1=1"));
        Self::apply_filter(&mut builder, filter);
        builder.push(" ORDER BY id");
        builder.push(" LIMIT ").push_bind(size as i64);
        builder
            .push(" OFFSET ")
            .push_bind(((page - 1) * size) as i64);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let rules = rows.iter().map(row_to_rule).collect::<Result<Vec<_>>>()?;
        Ok((rules, total as u64))
    }
}

// Exercised against a live PostgreSQL; run with
// `MIMIC_TEST_DATABASE_DSN=postgres://... cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> Option<DatabaseConfig> {
        let dsn = std::env::var("MIMIC_TEST_DATABASE_DSN").ok()?;
        Some(DatabaseConfig {
            dsn,
            max_open_conns: 5,
            max_idle_conns: 1,
            conn_max_lifetime_secs: 300,
            conn_max_idle_secs: 60,
        })
    }

    fn rule(id: &str, name: &str) -> MockRule {
        let mut rule = MockRule {
            id: id.into(),
            name: name.into(),
            protocol: "http".into(),
            match_config: serde_json::from_value(json!({
                "logical": "AND",
                "conditions": [{"type": "path", "operator": "eq", "value": "/sql/test"}]
            }))
            .unwrap(),
            action_config: serde_json::from_value(json!({
                "type": "response",
                "config": {"statusCode": 200, "body": "ok"}
            }))
            .unwrap(),
            priority: 1,
            status: RuleStatus::Active,
            method: "GET".into(),
            original_path: "/sql/test".into(),
            ..Default::default()
        };
        rule.prepare_for_save();
        rule
    }

    #[tokio::test]
    #[ignore] // Requires a live PostgreSQL.
    async fn save_get_delete_round_trip() {
        let Some(config) = test_config() else {
            eprintln!("Skipping test: MIMIC_TEST_DATABASE_DSN not set");
            return;
        };
        let store = SqlRuleStore::connect(&config).await.unwrap();
        store.migrate().await.unwrap();

        let r = rule("sql-test-1", "sql test one");
        store.save(&r).await.unwrap();

        let fetched = store.get("sql-test-1").await.unwrap();
        assert_eq!(fetched.name, "sql test one");
        assert_eq!(fetched.l1_match_index, r.l1_match_index);

        let listed = store
            .list(&RuleFilter::by_l1_index(r.l1_match_index.clone()))
            .await
            .unwrap();
        assert!(listed.iter().any(|x| x.id == "sql-test-1"));

        store.delete("sql-test-1").await.unwrap();
        assert!(matches!(
            store.get("sql-test-1").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires a live PostgreSQL.
    async fn name_protocol_uniqueness() {
        let Some(config) = test_config() else {
            eprintln!("Skipping test: MIMIC_TEST_DATABASE_DSN not set");
            return;
        };
        let store = SqlRuleStore::connect(&config).await.unwrap();
        store.migrate().await.unwrap();

        store.save(&rule("sql-uniq-1", "sql uniq")).await.unwrap();
        let err = store.save(&rule("sql-uniq-2", "sql uniq")).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists { .. }));

        store.delete("sql-uniq-1").await.unwrap();
    }
}
