//! Header lookup over ext_proc header maps.

use super::request::{HeaderValue, HttpHeaders};

/// HTTP/2 pseudo-header carrying the request method.
pub const METHOD_HEADER: &str = ":method";

/// HTTP/2 pseudo-header carrying the request path.
pub const PATH_HEADER: &str = ":path";

/// Header set on body rewrites.
pub const CONTENT_LENGTH_HEADER: &str = "Content-Length";

/// Returns the value of the first header named `name` (case-insensitive), or
/// an empty string when absent.
///
/// Prefers `value`; falls back to `rawValue` when the proxy only sends raw
/// bytes. Raw values that are not valid UTF-8 are decoded lossily since the
/// result is only used for logging and span attributes.
pub fn extract_header(name: &str, headers: &HttpHeaders) -> String {
    headers
        .headers
        .as_ref()
        .and_then(|map| {
            map.headers
                .iter()
                .find(|h| h.key.eq_ignore_ascii_case(name))
        })
        .map(header_text)
        .unwrap_or_default()
}

fn header_text(header: &HeaderValue) -> String {
    if !header.value.is_empty() {
        header.value.clone()
    } else {
        String::from_utf8_lossy(&header.raw_value).into_owned()
    }
}
