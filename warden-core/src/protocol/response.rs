//! Outbound messages: `ProcessingResponse` and the mutation shapes.

use serde::{Deserialize, Serialize};

use super::request::HeaderValue;
use super::{base64_bytes, is_false};

/// The filter's answer to one `ProcessingRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResponse {
    #[serde(flatten)]
    pub response: Response,
}

/// The payload variants of a `ProcessingResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Response {
    RequestHeaders(HeadersResponse),
    ResponseHeaders(HeadersResponse),
    RequestBody(BodyResponse),
    ResponseBody(BodyResponse),
    RequestTrailers(TrailersResponse),
    ResponseTrailers(TrailersResponse),
    ImmediateResponse(ImmediateResponse),
}

impl ProcessingResponse {
    /// The immediate response, if the exchange is being terminated.
    pub fn immediate(&self) -> Option<&ImmediateResponse> {
        match &self.response {
            Response::ImmediateResponse(r) => Some(r),
            _ => None,
        }
    }

    /// The common response of a continue-style answer.
    pub fn common(&self) -> Option<&CommonResponse> {
        match &self.response {
            Response::RequestHeaders(r) | Response::ResponseHeaders(r) => r.response.as_ref(),
            Response::RequestBody(r) | Response::ResponseBody(r) => r.response.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadersResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CommonResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CommonResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailersResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_mutation: Option<HeaderMutation>,
}

/// `CommonResponse`: continue, optionally with mutations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonResponse {
    #[serde(default)]
    pub status: ResponseStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_mutation: Option<HeaderMutation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_mutation: Option<BodyMutation>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub clear_route_cache: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    #[default]
    Continue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMutation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_headers: Vec<HeaderValueOption>,
}

impl HeaderMutation {
    /// A mutation that sets exactly the given headers.
    pub fn set<K, V>(headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            set_headers: headers
                .into_iter()
                .map(|(k, v)| HeaderValueOption {
                    header: HeaderValue::new(k, v),
                })
                .collect(),
        }
    }

    /// Looks up a header being set by this mutation.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.set_headers
            .iter()
            .find(|h| h.header.key.eq_ignore_ascii_case(key))
            .map(|h| h.header.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderValueOption {
    pub header: HeaderValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BodyMutation {
    Body(#[serde(with = "base64_bytes")] Vec<u8>),
}

/// `ImmediateResponse`: terminate the exchange with a local reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateResponse {
    pub status: HttpStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMutation>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// `type.v3.HttpStatus`, carried as the numeric status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpStatus {
    pub code: u16,
}

impl HttpStatus {
    pub const OK: HttpStatus = HttpStatus { code: 200 };
    pub const INTERNAL_SERVER_ERROR: HttpStatus = HttpStatus { code: 500 };
}
