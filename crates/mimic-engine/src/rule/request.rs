//! Protocol-neutral request abstraction.
//!
//! The matching pipeline never touches transport types directly: it sees a
//! [`RequestInfo`], which both the HTTP and gRPC adapters implement. Bodies
//! are read fully at construction and memoized, so repeated `body`/`body_json`
//! calls are cheap and side-effect-free.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::rule::l1_key;

/// Capability set every inbound request exposes to the engine.
pub trait RequestInfo: Send + Sync {
    /// Protocol identifier, e.g. "http" or "grpc".
    fn protocol(&self) -> &str;
    /// Request method (HTTP method, gRPC method name).
    fn method(&self) -> &str;
    /// Request path (HTTP path, gRPC service path).
    fn path(&self) -> &str;
    /// Headers with lowercased keys; multi-values comma-joined.
    fn headers(&self) -> &HashMap<String, String>;
    /// Raw request body.
    fn body(&self) -> &[u8];
    /// Body parsed as a JSON object, parsed once and cached.
    fn body_json(&self) -> Result<&Map<String, Value>>;
    /// L1 bucket key for candidate lookup.
    fn match_index(&self) -> String {
        l1_key(self.protocol(), self.method(), self.path())
    }
}

/// HTTP request view over already-read parts.
pub struct HttpRequestInfo {
    protocol: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Bytes,
    body_json: OnceLock<std::result::Result<Map<String, Value>, String>>,
}

impl HttpRequestInfo {
    /// Build from request parts. The caller has already read the body in
    /// full, so this constructor has no I/O and cannot fail.
    pub fn new(method: &Method, path: impl Into<String>, headers: &HeaderMap, body: Bytes) -> Self {
        Self {
            protocol: "http".to_string(),
            method: method.as_str().to_string(),
            path: path.into(),
            headers: lowercase_headers(headers),
            body,
            body_json: OnceLock::new(),
        }
    }

    /// Override the protocol label, e.g. "https" for TLS listeners.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}

/// Project a `HeaderMap` into lowercased keys with comma-joined multi-values.
fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_lowercase())
            .and_modify(|joined| {
                joined.push(',');
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

impl RequestInfo for HttpRequestInfo {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn body_json(&self) -> Result<&Map<String, Value>> {
        self.body_json
            .get_or_init(|| {
                serde_json::from_slice::<Map<String, Value>>(&self.body)
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| EngineError::ActionExecution(format!("request body is not a JSON object: {e}")))
    }
}

/// gRPC request view.
///
/// `full_method` is the wire form `/pkg.Service/Method`; `path()` exposes the
/// service portion and `method()` the trailing method name. The message is
/// carried already rendered as JSON with proto field names; decoding the
/// protobuf payload is the transport's job, not the engine's.
pub struct GrpcRequestInfo {
    full_method: String,
    metadata: HashMap<String, String>,
    body: Bytes,
    message_json: Option<Map<String, Value>>,
}

impl GrpcRequestInfo {
    pub fn new(
        full_method: impl Into<String>,
        metadata: HashMap<String, String>,
        body: Bytes,
        message_json: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            full_method: full_method.into(),
            metadata,
            body,
            message_json,
        }
    }

    fn method_parts(&self) -> Vec<&str> {
        self.full_method.split('/').collect()
    }
}

impl RequestInfo for GrpcRequestInfo {
    fn protocol(&self) -> &str {
        "grpc"
    }

    fn method(&self) -> &str {
        let parts = self.method_parts();
        if parts.len() >= 3 {
            parts[2]
        } else {
            &self.full_method
        }
    }

    fn path(&self) -> &str {
        let parts = self.method_parts();
        if parts.len() >= 2 {
            parts[1]
        } else {
            &self.full_method
        }
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn body_json(&self) -> Result<&Map<String, Value>> {
        self.message_json
            .as_ref()
            .ok_or_else(|| EngineError::ActionExecution("empty grpc message body".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, CONTENT_TYPE};
    use serde_json::json;

    fn json_body(value: Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn http_headers_are_lowercased_and_joined() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.append("X-Trace", HeaderValue::from_static("a"));
        headers.append("X-Trace", HeaderValue::from_static("b"));

        let req = HttpRequestInfo::new(&Method::GET, "/api/users", &headers, Bytes::new());
        assert_eq!(
            req.headers().get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(req.headers().get("x-trace").map(String::as_str), Some("a,b"));
        assert!(req.headers().get("X-Trace").is_none());
    }

    #[test]
    fn http_body_json_is_memoized() {
        let req = HttpRequestInfo::new(
            &Method::POST,
            "/api/users",
            &HeaderMap::new(),
            json_body(json!({"name": "alice"})),
        );

        let first = req.body_json().unwrap() as *const _;
        let second = req.body_json().unwrap() as *const _;
        assert_eq!(first, second);
        assert_eq!(req.body_json().unwrap()["name"], json!("alice"));
    }

    #[test]
    fn http_invalid_body_json_errors_without_panicking() {
        let req = HttpRequestInfo::new(
            &Method::POST,
            "/api/users",
            &HeaderMap::new(),
            Bytes::from_static(b"not json"),
        );
        assert!(req.body_json().is_err());
        // The raw body stays available regardless.
        assert_eq!(req.body(), b"not json");
    }

    #[test]
    fn http_match_index_uses_normalized_path() {
        let req = HttpRequestInfo::new(
            &Method::POST,
            "/api/users/123",
            &HeaderMap::new(),
            Bytes::new(),
        );
        assert_eq!(req.match_index(), "http_post_/api/users/*");
    }

    #[test]
    fn https_protocol_override() {
        let req = HttpRequestInfo::new(&Method::GET, "/", &HeaderMap::new(), Bytes::new())
            .with_protocol("https");
        assert_eq!(req.protocol(), "https");
    }

    #[test]
    fn grpc_splits_service_and_method() {
        let req = GrpcRequestInfo::new(
            "/shop.OrderService/CreateOrder",
            HashMap::new(),
            Bytes::new(),
            None,
        );
        assert_eq!(req.path(), "shop.OrderService");
        assert_eq!(req.method(), "CreateOrder");
        assert_eq!(req.protocol(), "grpc");
        assert_eq!(req.match_index(), "grpc_createorder_shop.OrderService");
    }

    #[test]
    fn grpc_degenerate_method_string_falls_back_whole() {
        let req = GrpcRequestInfo::new("CreateOrder", HashMap::new(), Bytes::new(), None);
        assert_eq!(req.path(), "CreateOrder");
        assert_eq!(req.method(), "CreateOrder");
    }

    #[test]
    fn grpc_message_json_round_trip() {
        let message = match json!({"order_id": "o-1"}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let req = GrpcRequestInfo::new(
            "/shop.OrderService/CreateOrder",
            HashMap::new(),
            Bytes::new(),
            Some(message),
        );
        assert_eq!(req.body_json().unwrap()["order_id"], json!("o-1"));

        let empty = GrpcRequestInfo::new("/s.S/M", HashMap::new(), Bytes::new(), None);
        assert!(empty.body_json().is_err());
    }
}
