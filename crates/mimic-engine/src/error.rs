//! Error taxonomy for the rule engine.
//!
//! Callers branch on these kinds, so the engine surface uses a single typed
//! enum rather than opaque error chains. The variants are `Clone` because
//! coalesced lookups deliver the same outcome to every waiting caller.

use thiserror::Error;

/// Errors produced by the rule engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The rule (or DTO) violates a structural invariant. Reported, never retried.
    #[error("invalid rule: {0}")]
    Validation(String),

    /// The rule is absent from the durable store.
    #[error("rule '{0}' not found")]
    NotFound(String),

    /// Unique `(name, protocol)` collision on save.
    #[error("rule with name '{name}' and protocol '{protocol}' already exists")]
    AlreadyExists { name: String, protocol: String },

    /// Transient durable-store failure. Retried per configured policy.
    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),

    /// Transient cache/index failure. Retried per configured policy.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// No rule matched the request. Not a failure of the engine itself.
    #[error("no matching rule found")]
    NoMatch,

    /// The async repair pool rejected a submission because its queue is full.
    #[error("worker pool saturated")]
    PoolSaturated,

    /// Template rendering failed or the action is misconfigured.
    #[error("action execution failed: {0}")]
    ActionExecution(String),

    /// Fatal startup configuration problem. The process must refuse to start.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Whether a retry could plausibly succeed. Validation, uniqueness and
    /// not-found outcomes are final; only infrastructure hiccups are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::StoreUnavailable(_) | EngineError::CacheUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
