//! The per-phase outcome handed to the proxy response builder.

use crate::protocol::headers::CONTENT_LENGTH_HEADER;
use crate::protocol::response::HttpStatus;

/// Outcome of processing one phase. Produced once, consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Let the message through, optionally rewritten.
    Continue(Option<Mutation>),

    /// End the exchange with a local reply (denials and immediate responses).
    Terminate {
        status: u16,
        body: String,
        details: &'static str,
    },

    /// The filter failed internally.
    Error { status: u16, message: String },
}

impl Verdict {
    pub fn error(message: impl Into<String>) -> Self {
        Verdict::Error {
            status: HttpStatus::INTERNAL_SERVER_ERROR.code,
            message: message.into(),
        }
    }

    /// Short label for logs and span records.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Continue(None) => "continue",
            Verdict::Continue(Some(_)) => "continue_with_mutation",
            Verdict::Terminate { .. } => "terminate",
            Verdict::Error { .. } => "error",
        }
    }
}

/// A header and body rewrite of the in-flight message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub set_headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Mutation {
    /// Replace the body and keep `Content-Length` in step with it.
    pub fn replace_body(body: Vec<u8>) -> Self {
        Self {
            set_headers: vec![(CONTENT_LENGTH_HEADER.to_string(), body.len().to_string())],
            body,
        }
    }
}
