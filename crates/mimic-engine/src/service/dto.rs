//! Wire DTOs for the management surface.
//!
//! The surrounding HTTP layer does nothing but decode the body into
//! [`CreateRuleRequest`] and serialize the returned [`ManageReply`]. By
//! convention both success and failure are written with HTTP 200 and the
//! outcome carried in the body, which keeps older tooling happy.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::rule::{ActionConfig, MatchConfig, MockRule, RuleStatus};

const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub protocol: String,
    #[serde(rename = "match")]
    pub match_config: MatchConfig,
    #[serde(rename = "action")]
    pub action_config: ActionConfig,
    #[serde(default)]
    pub priority: i64,
}

impl CreateRuleRequest {
    /// Validate the request against the rule invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation(format!(
                "name must be between 1 and {MAX_NAME_LEN} characters"
            )));
        }
        if self.protocol != "http" && self.protocol != "grpc" {
            return Err(EngineError::Validation(format!(
                "protocol must be 'http' or 'grpc', got '{}'",
                self.protocol
            )));
        }
        if self.priority < 0 {
            return Err(EngineError::Validation("priority must not be negative".into()));
        }
        self.match_config.validate()?;
        self.action_config.validate()
    }

    /// Convert into the aggregate. New rules are born active at version 1;
    /// the declared method and path are lifted from the match conditions so
    /// the rule lands in the right index bucket.
    pub fn into_rule(self) -> MockRule {
        let method = self
            .match_config
            .methods()
            .into_iter()
            .next()
            .unwrap_or_default();
        let original_path = self
            .match_config
            .paths()
            .first()
            .map(|p| p.to_string())
            .unwrap_or_default();

        MockRule {
            name: self.name,
            protocol: self.protocol,
            match_config: self.match_config,
            action_config: self.action_config,
            priority: self.priority,
            status: RuleStatus::Active,
            version: 1,
            method,
            path_pattern: original_path.clone(),
            original_path,
            ..Default::default()
        }
    }
}

/// Reply body for management operations: `{"message": "success"}` on
/// success, `{"error": "<message>"}` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManageReply {
    Ok { message: String },
    Failed { error: String },
}

impl ManageReply {
    pub fn success() -> Self {
        ManageReply::Ok {
            message: "success".into(),
        }
    }

    pub fn error(err: &EngineError) -> Self {
        ManageReply::Failed {
            error: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ManageReply::Ok { .. })
    }
}
