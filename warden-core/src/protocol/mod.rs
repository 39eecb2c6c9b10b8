//! Envoy external-processing message model.
//!
//! The types mirror `envoy.service.ext_proc.v3` as rendered by the protobuf
//! JSON mapping: camelCase field names, default values omitted and `bytes`
//! fields as standard base64. That JSON form is exactly what policies see as
//! their input, so the serde attributes here are part of the policy contract.

pub mod builder;
pub mod headers;
pub mod request;
pub mod response;

pub use headers::{extract_header, METHOD_HEADER, PATH_HEADER};
pub use request::{
    HeaderMap, HeaderValue, HttpBody, HttpHeaders, HttpTrailers, ProcessingRequest, Request,
};
pub use response::{
    BodyMutation, BodyResponse, CommonResponse, HeaderMutation, HeaderValueOption,
    HeadersResponse, HttpStatus, ImmediateResponse, ProcessingResponse, Response, ResponseStatus,
    TrailersResponse,
};

/// Serde adapter for protobuf `bytes` fields (standard base64 with padding).
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Helper for `skip_serializing_if` on proto3 booleans.
pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
