//! Action configuration and execution.
//!
//! Actions are a tagged union keyed by `type` on the wire:
//! `{"type": "response", "config": {...}}`. New action kinds slot in as
//! enum variants; dispatch stays data-driven through serde's tag handling.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::rule::request::RequestInfo;
use crate::rule::template::{merge_maps, render};

/// Tagged action variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum ActionConfig {
    Response(ResponseAction),
    Forward(ForwardAction),
    /// Reserved; not yet implemented.
    Error,
}

impl ActionConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ActionConfig::Response(action) => action.validate(),
            ActionConfig::Forward(action) => action.validate(),
            ActionConfig::Error => Err(EngineError::Validation(
                "error action is not implemented".into(),
            )),
        }
    }

    pub async fn execute(&self, req: &dyn RequestInfo) -> Result<MockResponse> {
        match self {
            ActionConfig::Response(action) => Ok(action.execute(req)),
            ActionConfig::Forward(action) => Ok(action.execute(req).await),
            ActionConfig::Error => Err(EngineError::ActionExecution(
                "error action is not implemented".into(),
            )),
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        ActionConfig::Response(ResponseAction::default())
    }
}

/// Synthetic response configuration.
///
/// `body_bytes` is runtime-only binary data: on emit it is written to
/// `body_base64` (and `body` cleared), on ingest a non-empty `body_base64`
/// is decoded back into `body_bytes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "ResponseActionWire", into = "ResponseActionWire")]
pub struct ResponseAction {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub body_bytes: Vec<u8>,
    pub body_base64: String,
    pub template: bool,
    pub template_data: Map<String, Value>,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseActionWire {
    #[serde(default = "default_status_code")]
    status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    body_base64: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    template: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    template_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    delay_ms: u64,
}

fn default_status_code() -> u16 {
    200
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl TryFrom<ResponseActionWire> for ResponseAction {
    type Error = String;

    fn try_from(wire: ResponseActionWire) -> std::result::Result<Self, String> {
        let body_bytes = if wire.body_base64.is_empty() {
            Vec::new()
        } else {
            BASE64
                .decode(&wire.body_base64)
                .map_err(|e| format!("invalid bodyBase64: {e}"))?
        };
        Ok(ResponseAction {
            status_code: wire.status_code,
            headers: wire.headers,
            body: wire.body,
            body_bytes,
            body_base64: wire.body_base64,
            template: wire.template,
            template_data: wire.template_data,
            delay_ms: wire.delay_ms,
        })
    }
}

impl From<ResponseAction> for ResponseActionWire {
    fn from(action: ResponseAction) -> Self {
        let (body, body_base64) = if action.body_bytes.is_empty() {
            (action.body, action.body_base64)
        } else {
            (String::new(), BASE64.encode(&action.body_bytes))
        };
        ResponseActionWire {
            status_code: action.status_code,
            headers: action.headers,
            body,
            body_base64,
            template: action.template,
            template_data: action.template_data,
            delay_ms: action.delay_ms,
        }
    }
}

impl ResponseAction {
    pub fn validate(&self) -> Result<()> {
        if !(100..=599).contains(&self.status_code) {
            return Err(EngineError::Validation(format!(
                "statusCode must be in [100, 599], got {}",
                self.status_code
            )));
        }
        Ok(())
    }

    /// Produce the configured response. Precedence: binary body, then
    /// template rendering, then the plain text body. Render failures are
    /// carried on the response (`err` set, status falling back to 200)
    /// rather than surfaced as hard errors.
    pub fn execute(&self, req: &dyn RequestInfo) -> MockResponse {
        if !self.body_bytes.is_empty() {
            return self.response_with(self.body_bytes.clone());
        }

        if self.template {
            let request_data = match req.body_json() {
                Ok(map) => map.clone(),
                Err(e) => return MockResponse::render_failure(e),
            };
            let merged = merge_maps(&self.template_data, &request_data);
            return match render(&self.body, &merged) {
                Ok(rendered) => self.response_with(rendered.into_bytes()),
                Err(e) => MockResponse::render_failure(e),
            };
        }

        self.response_with(self.body.clone().into_bytes())
    }

    fn response_with(&self, body: Vec<u8>) -> MockResponse {
        MockResponse {
            status: self.status_code,
            headers: self.headers.clone(),
            body,
            delay: Duration::from_millis(self.delay_ms),
            err: None,
        }
    }
}

/// Forward the request to an upstream and relay its response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAction {
    #[serde(rename = "forwardURL")]
    pub forward_url: String,
}

static FORWARD_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn forward_client() -> &'static reqwest::Client {
    FORWARD_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build forward client")
    })
}

impl ForwardAction {
    pub fn validate(&self) -> Result<()> {
        if self.forward_url.is_empty() {
            return Err(EngineError::Validation("forwardURL is required".into()));
        }
        if !self.forward_url.starts_with("http://") && !self.forward_url.starts_with("https://") {
            return Err(EngineError::Validation(format!(
                "forwardURL must be an http(s) URL, got '{}'",
                self.forward_url
            )));
        }
        Ok(())
    }

    /// Replay the request against the upstream. Network failures are carried
    /// on the response like render failures, keeping the hot path total.
    pub async fn execute(&self, req: &dyn RequestInfo) -> MockResponse {
        let url = format!(
            "{}{}",
            self.forward_url.trim_end_matches('/'),
            req.path()
        );
        let method = match reqwest::Method::from_bytes(req.method().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return MockResponse::render_failure(EngineError::ActionExecution(format!(
                    "invalid forward method '{}'",
                    req.method()
                )))
            }
        };

        let mut builder = forward_client()
            .request(method, &url)
            .body(req.body().to_vec());
        for (name, value) in req.headers() {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(upstream) => {
                let status = upstream.status().as_u16();
                let headers = upstream
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let body = match upstream.bytes().await {
                    Ok(b) => b.to_vec(),
                    Err(e) => {
                        warn!(url, error = %e, "failed to read forward response body");
                        return MockResponse::render_failure(EngineError::ActionExecution(
                            format!("failed to read forward response: {e}"),
                        ));
                    }
                };
                MockResponse {
                    status,
                    headers,
                    body,
                    delay: Duration::ZERO,
                    err: None,
                }
            }
            Err(e) => {
                warn!(url, error = %e, "forward request failed");
                MockResponse::render_failure(EngineError::ActionExecution(format!(
                    "forward to '{url}' failed: {e}"
                )))
            }
        }
    }
}

/// Response value produced by executing an action.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    delay: Duration,
    err: Option<EngineError>,
}

impl MockResponse {
    fn render_failure(err: EngineError) -> Self {
        MockResponse {
            err: Some(err),
            ..Default::default()
        }
    }

    /// Status code; an unset status falls back to 200.
    pub fn status(&self) -> u16 {
        if self.status == 0 {
            200
        } else {
            self.status
        }
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_json(&self) -> Result<Map<String, Value>> {
        serde_json::from_slice(&self.body)
            .map_err(|e| EngineError::ActionExecution(format!("response body is not JSON: {e}")))
    }

    /// Configured artificial delay; the transport is responsible for
    /// applying it before writing the response.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn err(&self) -> Option<&EngineError> {
        self.err.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use serde_json::json;

    use crate::rule::request::HttpRequestInfo;

    fn json_request(body: Value) -> HttpRequestInfo {
        HttpRequestInfo::new(
            &Method::POST,
            "/api/test",
            &HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
    }

    fn response_action(value: Value) -> ResponseAction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn binary_body_takes_precedence() {
        let mut action = response_action(json!({"statusCode": 201, "body": "text"}));
        action.body_bytes = vec![0xde, 0xad];
        action.template = true;

        let resp = action.execute(&json_request(json!({})));
        assert_eq!(resp.status(), 201);
        assert_eq!(resp.body(), &[0xde, 0xad]);
        assert!(resp.err().is_none());
    }

    #[test]
    fn template_renders_over_merged_data() {
        let action = response_action(json!({
            "statusCode": 200,
            "template": true,
            "templateData": {"greeting": "hello"},
            "body": "{\"message\":\"${greeting} ${user}\"}"
        }));

        let resp = action.execute(&json_request(json!({"user": "alice"})));
        assert_eq!(resp.status(), 200);
        assert_eq!(
            String::from_utf8_lossy(resp.body()),
            "{\"message\":\"hello alice\"}"
        );
    }

    #[test]
    fn request_data_overrides_template_data() {
        let action = response_action(json!({
            "statusCode": 200,
            "template": true,
            "templateData": {"user": "default"},
            "body": "${user}"
        }));
        let resp = action.execute(&json_request(json!({"user": "alice"})));
        assert_eq!(resp.body(), b"alice");
    }

    #[test]
    fn render_failure_is_observable_but_not_fatal() {
        let action = response_action(json!({
            "statusCode": 500,
            "template": true,
            "body": "${missing}"
        }));
        let resp = action.execute(&json_request(json!({})));
        assert!(resp.err().is_some());
        assert_eq!(resp.status(), 200); // status falls back on render failure
    }

    #[test]
    fn plain_body_returned_verbatim() {
        let action = response_action(json!({"statusCode": 404, "body": "gone"}));
        let resp = action.execute(&json_request(json!({})));
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.body(), b"gone");
        assert_eq!(resp.delay(), Duration::ZERO);
    }

    #[test]
    fn delay_is_carried_on_the_response() {
        let action = response_action(json!({"statusCode": 200, "delayMs": 250}));
        let resp = action.execute(&json_request(json!({})));
        assert_eq!(resp.delay(), Duration::from_millis(250));
    }

    #[test]
    fn status_code_validation() {
        assert!(response_action(json!({"statusCode": 99})).validate().is_err());
        assert!(response_action(json!({"statusCode": 600})).validate().is_err());
        assert!(response_action(json!({"statusCode": 100})).validate().is_ok());
        assert!(response_action(json!({"statusCode": 599})).validate().is_ok());
    }

    #[test]
    fn body_bytes_base64_round_trip() {
        let mut action = response_action(json!({"statusCode": 200, "body": "text"}));
        action.body_bytes = vec![1, 2, 3, 255];

        let emitted = serde_json::to_value(ActionConfig::Response(action)).unwrap();
        // On emit, bytes go to bodyBase64 and body is cleared.
        assert_eq!(emitted["config"]["bodyBase64"], json!(BASE64.encode([1, 2, 3, 255])));
        assert!(emitted["config"].get("body").is_none());

        let restored: ActionConfig = serde_json::from_value(emitted).unwrap();
        match restored {
            ActionConfig::Response(r) => assert_eq!(r.body_bytes, vec![1, 2, 3, 255]),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn invalid_base64_is_a_deserialization_error() {
        let raw = json!({"type": "response", "config": {"statusCode": 200, "bodyBase64": "!!!"}});
        assert!(serde_json::from_value::<ActionConfig>(raw).is_err());
    }

    #[test]
    fn tagged_union_wire_format() {
        let raw = json!({"type": "forward", "config": {"forwardURL": "http://upstream:8080"}});
        let action: ActionConfig = serde_json::from_value(raw).unwrap();
        match &action {
            ActionConfig::Forward(f) => assert_eq!(f.forward_url, "http://upstream:8080"),
            other => panic!("unexpected action: {other:?}"),
        }
        assert!(action.validate().is_ok());

        let error_action: ActionConfig = serde_json::from_value(json!({"type": "error"})).unwrap();
        assert!(error_action.validate().is_err());
    }

    #[test]
    fn forward_url_validation() {
        let empty = ForwardAction::default();
        assert!(empty.validate().is_err());

        let bad_scheme = ForwardAction {
            forward_url: "ftp://nope".into(),
        };
        assert!(bad_scheme.validate().is_err());

        let ok = ForwardAction {
            forward_url: "https://upstream".into(),
        };
        assert!(ok.validate().is_ok());
    }

    #[tokio::test]
    async fn forward_failure_is_carried_on_the_response() {
        // Unroutable port: the forward fails fast and the error rides on the
        // response rather than propagating.
        let action = ForwardAction {
            forward_url: "http://127.0.0.1:1".into(),
        };
        let resp = action.execute(&json_request(json!({}))).await;
        assert!(resp.err().is_some());
        assert_eq!(resp.status(), 200);
    }
}
