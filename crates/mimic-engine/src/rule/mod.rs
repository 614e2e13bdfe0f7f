//! Rule aggregate and its derived index keys.
//!
//! A [`MockRule`] carries the match configuration, the action to execute,
//! and the bookkeeping fields (priority, status, version, timestamps). Its
//! `l1_match_index` is always a pure function of `(protocol, method,
//! original_path)` and is recomputed by the repository before every save;
//! nothing else is allowed to write it.

pub mod action;
pub mod matcher;
pub mod normalize;
pub mod request;
pub mod template;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
pub use action::{ActionConfig, ForwardAction, MockResponse, ResponseAction};
pub use matcher::{ConditionOperator, ConditionType, Logical, MatchCondition, MatchConfig};
pub use normalize::normalize_path;
pub use request::{GrpcRequestInfo, HttpRequestInfo, RequestInfo};

/// Lifecycle state of a rule. Only `active` rules participate in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Active,
    Inactive,
    #[default]
    Draft,
    Archived,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Inactive => "inactive",
            RuleStatus::Draft => "draft",
            RuleStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RuleStatus::Active),
            "inactive" => Ok(RuleStatus::Inactive),
            "draft" => Ok(RuleStatus::Draft),
            "archived" => Ok(RuleStatus::Archived),
            other => Err(EngineError::Validation(format!(
                "unknown rule status '{other}'"
            ))),
        }
    }
}

/// Mock rule aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MockRule {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub protocol: String,
    #[serde(rename = "match")]
    pub match_config: MatchConfig,
    #[serde(rename = "action")]
    pub action_config: ActionConfig,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    /// Raw method as declared, empty when the rule is method-agnostic.
    #[serde(default)]
    pub method: String,
    /// Raw path as declared.
    #[serde(default)]
    pub original_path: String,
    /// Pattern actually used for regex matching; usually `original_path`.
    #[serde(default)]
    pub path_pattern: String,
    /// Derived bucket key; recomputed on every write.
    #[serde(default)]
    pub l1_match_index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<i64>,
}

fn default_version() -> i64 {
    1
}

impl MockRule {
    /// Structural validation, enforced before any write is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.protocol.is_empty() {
            return Err(EngineError::Validation("protocol must not be empty".into()));
        }
        self.match_config.validate()?;
        self.action_config.validate()
    }

    /// Whether this rule applies to the request. Inactive rules and
    /// protocol mismatches never match.
    pub fn is_match(&self, req: &dyn RequestInfo) -> bool {
        if self.status != RuleStatus::Active {
            return false;
        }
        if self.protocol != req.protocol() {
            return false;
        }
        self.match_config.is_match(req)
    }

    /// Execute the configured action. Pre-checks reject rules that are not
    /// active or have no usable action config.
    pub async fn execute_action(&self, req: &dyn RequestInfo) -> Result<MockResponse> {
        if self.status != RuleStatus::Active {
            return Err(EngineError::ActionExecution(format!(
                "rule '{}' is not active (status: {})",
                self.id,
                self.status.as_str()
            )));
        }
        tracing::info!(
            rule = %self.name,
            protocol = %self.protocol,
            priority = self.priority,
            "executing rule action"
        );
        self.action_config.execute(req).await
    }

    /// Assign a deterministic-enough ID derived from the name when the
    /// caller did not provide one.
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            let sanitized = self.name.to_lowercase().replace(' ', "_");
            self.id = format!("mock_{sanitized}_{}", unix_nanos());
        }
    }

    /// Recompute the derived index key and bookkeeping fields. Called by the
    /// repository immediately before every durable write.
    pub fn prepare_for_save(&mut self) {
        if self.path_pattern.is_empty() {
            self.path_pattern = self.original_path.clone();
        }
        self.l1_match_index = l1_key(&self.protocol, &self.method, &self.original_path);
        if self.version == 0 {
            self.version = default_version();
        }
        let now = unix_now();
        if self.created_at == 0 {
            self.created_at = now;
        }
        self.updated_at = now;
    }

    /// The bucket key this rule is indexed under.
    pub fn l1_index_key(&self) -> String {
        if self.l1_match_index.is_empty() {
            l1_key(&self.protocol, &self.method, &self.original_path)
        } else {
            self.l1_match_index.clone()
        }
    }
}

/// Build the L1 bucket key from protocol, method and path. An empty method
/// buckets as `*`.
pub fn l1_key(protocol: &str, method: &str, path: &str) -> String {
    let method = if method.is_empty() { "*" } else { method };
    format!(
        "{}_{}_{}",
        protocol.to_lowercase(),
        method.to_lowercase(),
        normalize_path(path)
    )
}

/// Durable-store listing filter. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub id: Option<String>,
    pub protocol: Option<String>,
    pub created_by: Option<i64>,
    pub is_enabled: Option<bool>,
    pub path_contains: Option<String>,
    pub l1_match_index: Option<String>,
}

impl RuleFilter {
    pub fn by_l1_index(l1: impl Into<String>) -> Self {
        RuleFilter {
            l1_match_index: Some(l1.into()),
            ..Default::default()
        }
    }

    /// Stable digest for coalescing keys of listing operations.
    pub fn digest(&self, page: u64, size: u64) -> String {
        let mut parts = Vec::new();
        if let Some(id) = &self.id {
            parts.push(format!("rid:{id}"));
        }
        if let Some(protocol) = &self.protocol {
            parts.push(format!("proto:{protocol}"));
        }
        if let Some(uid) = self.created_by {
            parts.push(format!("uid:{uid}"));
        }
        if let Some(enabled) = self.is_enabled {
            parts.push(format!("enabled:{enabled}"));
        }
        if let Some(path) = &self.path_contains {
            parts.push(format!("path:{path}"));
        }
        if let Some(l1) = &self.l1_match_index {
            parts.push(format!("l1:{l1}"));
        }
        parts.push(format!("page:{page}"));
        parts.push(format!("size:{size}"));
        parts.join("_")
    }

    /// In-process evaluation of the filter, shared by the memory store.
    pub fn matches(&self, rule: &MockRule) -> bool {
        if let Some(id) = &self.id {
            if &rule.id != id {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if &rule.protocol != protocol {
                return false;
            }
        }
        if let Some(uid) = self.created_by {
            if rule.created_by != Some(uid) {
                return false;
            }
        }
        if let Some(enabled) = self.is_enabled {
            if (rule.status == RuleStatus::Active) != enabled {
                return false;
            }
        }
        if let Some(fragment) = &self.path_contains {
            let serialized = serde_json::to_string(&rule.match_config).unwrap_or_default();
            if !serialized.contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(l1) = &self.l1_match_index {
            if &rule.l1_match_index != l1 {
                return false;
            }
        }
        true
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
