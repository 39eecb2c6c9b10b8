//! Inbound messages: `ProcessingRequest` and its payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{base64_bytes, is_false};
use crate::engine::phase::Phase;

/// One message streamed by the proxy for an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRequest {
    /// The lifecycle payload (the protobuf `oneof request`).
    #[serde(flatten)]
    pub request: Request,

    /// Dynamic metadata forwarded by the proxy, kept opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_context: Option<Value>,

    /// Proxy attributes requested by the filter configuration.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub observability_mode: bool,

    /// Processing mode negotiation, sent on the first message of a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_config: Option<Value>,

    /// Any field this model does not name, kept so policy input stays
    /// lossless across proxy versions.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The payload variants of a `ProcessingRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    RequestHeaders(HttpHeaders),
    RequestBody(HttpBody),
    ResponseHeaders(HttpHeaders),
    ResponseBody(HttpBody),
    RequestTrailers(HttpTrailers),
    ResponseTrailers(HttpTrailers),
}

impl Request {
    /// The policy phase this payload drives, `None` for trailers.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Request::RequestHeaders(_) => Some(Phase::RequestHeaders),
            Request::RequestBody(_) => Some(Phase::RequestBody),
            Request::ResponseHeaders(_) => Some(Phase::ResponseHeaders),
            Request::ResponseBody(_) => Some(Phase::ResponseBody),
            Request::RequestTrailers(_) | Request::ResponseTrailers(_) => None,
        }
    }

    /// Name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::RequestHeaders(_) => "request headers",
            Request::RequestBody(_) => "request body",
            Request::ResponseHeaders(_) => "response headers",
            Request::ResponseBody(_) => "response body",
            Request::RequestTrailers(_) => "request trailers",
            Request::ResponseTrailers(_) => "response trailers",
        }
    }
}

impl ProcessingRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            metadata_context: None,
            attributes: Map::new(),
            observability_mode: false,
            protocol_config: None,
            extra: Map::new(),
        }
    }

    pub fn request_headers(headers: HttpHeaders) -> Self {
        Self::new(Request::RequestHeaders(headers))
    }

    pub fn request_body(body: HttpBody) -> Self {
        Self::new(Request::RequestBody(body))
    }

    pub fn response_headers(headers: HttpHeaders) -> Self {
        Self::new(Request::ResponseHeaders(headers))
    }

    pub fn response_body(body: HttpBody) -> Self {
        Self::new(Request::ResponseBody(body))
    }

    /// The headers payload, if this message carries one.
    pub fn headers(&self) -> Option<&HttpHeaders> {
        match &self.request {
            Request::RequestHeaders(h) | Request::ResponseHeaders(h) => Some(h),
            _ => None,
        }
    }

    /// The body payload, if this message carries one.
    pub fn body(&self) -> Option<&HttpBody> {
        match &self.request {
            Request::RequestBody(b) | Request::ResponseBody(b) => Some(b),
            _ => None,
        }
    }
}

/// `HttpHeaders`: a header map plus the end-of-stream flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMap>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub end_of_stream: bool,
}

impl HttpHeaders {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            headers: Some(HeaderMap {
                headers: pairs
                    .into_iter()
                    .map(|(k, v)| HeaderValue::new(k, v))
                    .collect(),
            }),
            end_of_stream: false,
        }
    }
}

/// `HttpBody`: one (possibly partial) body chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBody {
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub end_of_stream: bool,
}

impl HttpBody {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            end_of_stream: true,
        }
    }
}

/// `HttpTrailers`: trailing headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTrailers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailers: Option<HeaderMap>,
}

/// `config.core.v3.HeaderMap`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderMap {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderValue>,
}

/// `config.core.v3.HeaderValue`. Newer proxies send `rawValue` instead of `value`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValue {
    pub key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub raw_value: Vec<u8>,
}

impl HeaderValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            raw_value: Vec::new(),
        }
    }

    pub fn raw(key: impl Into<String>, raw_value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            raw_value: raw_value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_headers_json_mapping() {
        let req = ProcessingRequest::request_headers(HttpHeaders::from_pairs([
            (":method", "GET"),
            (":path", "/data"),
        ]));

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "requestHeaders": {
                    "headers": {
                        "headers": [
                            {"key": ":method", "value": "GET"},
                            {"key": ":path", "value": "/data"}
                        ]
                    }
                }
            })
        );
    }

    #[test]
    fn test_binary_body_survives_json() {
        let raw = vec![0u8, 159, 146, 150, 255];
        let req = ProcessingRequest::response_body(HttpBody::new(raw.clone()));

        let text = serde_json::to_string(&req).unwrap();
        assert!(text.contains("\"responseBody\""));
        assert!(text.contains("\"endOfStream\":true"));

        let back: ProcessingRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.body().map(|b| b.body.clone()), Some(raw));
    }

    #[test]
    fn test_parse_proxy_message_with_attributes() {
        let value = json!({
            "requestBody": {"body": "eyJ4IjoxfQ==", "endOfStream": true},
            "attributes": {"envoy.filters.http.ext_proc": {"request.id": "abc"}},
            "metadataContext": {"filterMetadata": {}}
        });

        let req: ProcessingRequest = serde_json::from_value(value).unwrap();
        assert_eq!(req.request.phase(), Some(Phase::RequestBody));
        assert_eq!(req.body().unwrap().body, b"{\"x\":1}".to_vec());
        assert!(req.attributes.contains_key("envoy.filters.http.ext_proc"));
        assert!(req.metadata_context.is_some());
    }

    #[test]
    fn test_unmodelled_fields_are_kept() {
        let value = json!({
            "requestHeaders": {"headers": {"headers": [{"key": "x-id", "value": "7"}]}},
            "protocolConfig": {"requestBodyMode": "BUFFERED"},
            "futureField": {"enabled": true}
        });

        let req: ProcessingRequest = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(req.request.phase(), Some(Phase::RequestHeaders));
        assert_eq!(req.protocol_config, Some(json!({"requestBodyMode": "BUFFERED"})));
        assert_eq!(req.extra.len(), 1);
        assert!(!req.extra.contains_key("requestHeaders"));

        assert_eq!(serde_json::to_value(&req).unwrap(), value);
    }

    #[test]
    fn test_trailers_have_no_phase() {
        let req = ProcessingRequest::new(Request::RequestTrailers(HttpTrailers::default()));
        assert_eq!(req.request.phase(), None);
        assert_eq!(req.request.kind(), "request trailers");
    }
}
