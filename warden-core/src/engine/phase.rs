//! Exchange lifecycle phases and their policy query names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four points at which the proxy hands control to the filter.
///
/// Variants are declared in lifecycle order, so `Ord` is the phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::RequestHeaders,
        Phase::RequestBody,
        Phase::ResponseHeaders,
        Phase::ResponseBody,
    ];

    /// The Rego rule evaluated for this phase.
    pub fn query_name(self) -> &'static str {
        match self {
            Phase::RequestHeaders => "on_request_headers",
            Phase::RequestBody => "on_request_body",
            Phase::ResponseHeaders => "on_response_headers",
            Phase::ResponseBody => "on_response_body",
        }
    }

    /// The compiled entrypoint path for this phase under `package`
    /// (`cleanroom.policy` becomes `cleanroom/policy/on_request_headers`).
    pub fn entrypoint(self, package: &str) -> String {
        format!("{}/{}", package.replace('.', "/"), self.query_name())
    }

    pub fn is_body(self) -> bool {
        matches!(self, Phase::RequestBody | Phase::ResponseBody)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.query_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phases = Phase::ALL;
        phases.reverse();
        phases.sort();
        assert_eq!(phases, Phase::ALL);
        assert!(Phase::RequestBody < Phase::ResponseHeaders);
    }

    #[test]
    fn test_entrypoint_paths() {
        assert_eq!(
            Phase::RequestHeaders.entrypoint("cleanroom.policy"),
            "cleanroom/policy/on_request_headers"
        );
        assert_eq!(Phase::ResponseBody.entrypoint("ccr"), "ccr/on_response_body");
    }

    #[test]
    fn test_body_phases() {
        let bodies: Vec<Phase> = Phase::ALL.into_iter().filter(|p| p.is_body()).collect();
        assert_eq!(bodies, vec![Phase::RequestBody, Phase::ResponseBody]);
    }
}
