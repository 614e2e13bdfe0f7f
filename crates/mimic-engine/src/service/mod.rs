//! Domain services: request matching and rule management.
//!
//! Both are thin compositions over the repository; all storage
//! coordination lives there.

mod dto;

use std::sync::Arc;

use tracing::{info, warn};

pub use dto::{CreateRuleRequest, ManageReply};

use crate::error::{EngineError, Result};
use crate::repo::RuleRepository;
use crate::rule::{MockRule, MockResponse, RequestInfo};

/// End-to-end matching pipeline: request → L1 key → candidates → winner.
pub struct RuleMatchService {
    repo: Arc<RuleRepository>,
}

impl RuleMatchService {
    pub fn new(repo: Arc<RuleRepository>) -> Self {
        Self { repo }
    }

    /// Find the winning rule for a request.
    ///
    /// The repository already filtered candidates, but a sorted-set entry
    /// can go stale between read and use, so the winner is re-evaluated
    /// before being handed out.
    pub async fn match_rule(&self, req: &dyn RequestInfo) -> Result<MockRule> {
        let rule = self.repo.find_best_match(req).await?;
        if !rule.match_config.is_match(req) {
            warn!(rule_id = %rule.id, "index returned a stale candidate, treating as no match");
            return Err(EngineError::NoMatch);
        }
        Ok(rule)
    }

    /// Execute a matched rule's action against the request.
    pub async fn execute_rule_action(
        &self,
        rule: &MockRule,
        req: &dyn RequestInfo,
    ) -> Result<MockResponse> {
        rule.execute_action(req).await
    }
}

/// Management operations invoked by the surrounding HTTP layer.
pub struct RuleManageService {
    repo: Arc<RuleRepository>,
}

impl RuleManageService {
    pub fn new(repo: Arc<RuleRepository>) -> Self {
        Self { repo }
    }

    /// Validate and persist a rule from the wire DTO. The reply carries the
    /// outcome in the body either way; status mapping is the transport's
    /// business.
    pub async fn create_rule(&self, request: CreateRuleRequest) -> ManageReply {
        match self.try_create(request).await {
            Ok(rule) => {
                info!(rule_id = %rule.id, rule = %rule.name, "rule created");
                ManageReply::success()
            }
            Err(e) => {
                warn!(error = %e, "rule creation failed");
                ManageReply::error(&e)
            }
        }
    }

    async fn try_create(&self, request: CreateRuleRequest) -> Result<MockRule> {
        request.validate()?;
        self.repo.save(request.into_rule()).await
    }

    /// Remove a rule and its cache/index entries.
    pub async fn delete_rule(&self, id: &str) -> ManageReply {
        match self.repo.delete(id).await {
            Ok(()) => ManageReply::success(),
            Err(e) => {
                warn!(rule_id = id, error = %e, "rule deletion failed");
                ManageReply::error(&e)
            }
        }
    }
}
