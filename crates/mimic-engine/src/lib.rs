//! Rule matching and dispatch engine for the Mimic mock server.
//!
//! Operators register rules describing how to match incoming requests and
//! what synthetic response to produce. At runtime each request is reduced
//! to an L1 bucket key, candidate rules come back from a tiered store
//! (durable SQL + hot cache + sorted priority index), the highest-priority
//! matching rule wins, and its action is executed.
//!
//! The transport layer (HTTP routing, handler wiring) stays outside this
//! crate: it constructs a [`rule::RequestInfo`] per request and hands the
//! resulting [`rule::MockResponse`] back to the client.

// ===== Domain =====
pub mod rule;

// ===== Storage pipeline =====
pub mod repo;
pub mod storage;

// ===== Services (management + matching) =====
pub mod service;

// ===== Ambient =====
pub mod config;
pub mod error;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use repo::RuleRepository;
pub use rule::{MockResponse, MockRule, RequestInfo};
pub use service::{CreateRuleRequest, ManageReply, RuleManageService, RuleMatchService};
