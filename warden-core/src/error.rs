//! Error taxonomy for the per-exchange decision pipeline.
//!
//! Every variant surfaces to the proxy as an internal-error response and is
//! recorded as a fault on the phase span. A policy denial is not an error: it
//! is a terminate verdict plus a disallowed span event.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    /// The intercepted message could not be turned into policy input.
    #[error("failed to convert message to policy input: {0}")]
    Conversion(String),

    /// The evaluation engine itself failed.
    #[error("policy query '{query}' failed to evaluate")]
    Evaluation {
        query: String,
        #[source]
        source: anyhow::Error,
    },

    /// Zero result sets: the policy made no determination.
    #[error("got undefined result on running query '{query}'")]
    UndefinedResult { query: String },

    /// More than one result set for a single query.
    #[error("got {count} evaluation results on running query '{query}'")]
    AmbiguousResult { query: String, count: usize },

    /// A required decision field is absent or has the wrong shape.
    #[error("malformed decision field '{field}': {reason}")]
    MalformedDecision { field: &'static str, reason: String },
}

impl FilterError {
    /// Short machine-friendly kind used in telemetry events.
    pub fn kind(&self) -> &'static str {
        match self {
            FilterError::Conversion(_) => "conversion",
            FilterError::Evaluation { .. } => "evaluation",
            FilterError::UndefinedResult { .. } => "undefined_result",
            FilterError::AmbiguousResult { .. } => "ambiguous_result",
            FilterError::MalformedDecision { .. } => "malformed_decision",
        }
    }

    /// The message with its source chain, `outer: inner: root`.
    pub fn report(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }

    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        FilterError::MalformedDecision {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
