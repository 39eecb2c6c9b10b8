//! Warden Core - policy enforcement for Envoy external processing.
//!
//! The proxy streams each exchange's lifecycle (request headers, request
//! body, response headers, response body) to the filter; every phase is
//! evaluated against a Rego policy compiled to WebAssembly and answered with
//! continue, a rewrite, or a local reply.

pub mod engine;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use engine::{ExchangeProcessor, Phase, PolicyFilter, Verdict};
pub use error::FilterError;
