//! Proxy response builder: maps verdicts onto `ProcessingResponse` shapes.
//!
//! Stateless and infallible; everything reaching here was already validated
//! by the exchange processor.

use super::response::{
    BodyMutation, BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, HttpStatus,
    ImmediateResponse, ProcessingResponse, Response, ResponseStatus, TrailersResponse,
};
use crate::engine::phase::Phase;
use crate::engine::verdict::Verdict;

/// Continue without touching the message.
pub fn continue_response(phase: Phase) -> ProcessingResponse {
    mutation_response(phase, None, None)
}

/// Continue, applying the given header and body mutations.
pub fn mutation_response(
    phase: Phase,
    header_mutation: Option<HeaderMutation>,
    body_mutation: Option<BodyMutation>,
) -> ProcessingResponse {
    let common = Some(CommonResponse {
        status: ResponseStatus::Continue,
        header_mutation,
        body_mutation,
        clear_route_cache: false,
    });

    let response = match phase {
        Phase::RequestHeaders => Response::RequestHeaders(HeadersResponse { response: common }),
        Phase::ResponseHeaders => Response::ResponseHeaders(HeadersResponse { response: common }),
        Phase::RequestBody => Response::RequestBody(BodyResponse { response: common }),
        Phase::ResponseBody => Response::ResponseBody(BodyResponse { response: common }),
    };
    ProcessingResponse { response }
}

/// Terminate the exchange with a local reply.
pub fn immediate_response(
    status: u16,
    body: impl Into<String>,
    details: impl Into<String>,
) -> ProcessingResponse {
    ProcessingResponse {
        response: Response::ImmediateResponse(ImmediateResponse {
            status: HttpStatus { code: status },
            headers: None,
            body: body.into(),
            details: details.into(),
        }),
    }
}

/// Terminate the exchange because the filter itself failed.
pub fn error_response(status: u16, message: impl Into<String>) -> ProcessingResponse {
    let message = message.into();
    immediate_response(status, message.clone(), message)
}

/// Acknowledge trailers, which are observed but never evaluated.
pub fn request_trailers_response() -> ProcessingResponse {
    ProcessingResponse {
        response: Response::RequestTrailers(TrailersResponse::default()),
    }
}

pub fn response_trailers_response() -> ProcessingResponse {
    ProcessingResponse {
        response: Response::ResponseTrailers(TrailersResponse::default()),
    }
}

/// The proxy-level shape of a phase verdict.
pub fn from_verdict(phase: Phase, verdict: &Verdict) -> ProcessingResponse {
    match verdict {
        Verdict::Continue(None) => continue_response(phase),
        Verdict::Continue(Some(mutation)) => mutation_response(
            phase,
            Some(HeaderMutation::set(mutation.set_headers.iter().cloned())),
            Some(BodyMutation::Body(mutation.body.clone())),
        ),
        Verdict::Terminate {
            status,
            body,
            details,
        } => immediate_response(*status, body.as_str(), *details),
        Verdict::Error { status, message } => error_response(*status, message.as_str()),
    }
}
