//! Exchange processor - the per-exchange phase state machine.
//!
//! One `ExchangeProcessor` is created per intercepted exchange and owns all
//! of that exchange's mutable state (request line and ambient context). The
//! shared [`PolicyEvaluator`] is only ever read, so concurrent exchanges need
//! no locking.
//!
//! Per phase the outcome is decided in a fixed order:
//!
//! 1. the policy denied (`allowed: false`) -> terminate with its status/body
//! 2. the policy answered itself (`isImmediateResponse`) -> terminate with 200
//! 3. otherwise continue, threading `responseContext` forward and, on body
//!    phases, rewriting the body when the policy returned a different one

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};

use super::decision::DecisionDocument;
use super::evaluator::PolicyEvaluator;
use super::input::build_input;
use super::phase::Phase;
use super::verdict::{Mutation, Verdict};
use crate::error::FilterError;
use crate::protocol::builder;
use crate::protocol::headers::{extract_header, METHOD_HEADER, PATH_HEADER};
use crate::protocol::request::{ProcessingRequest, Request};
use crate::protocol::response::{HttpStatus, ProcessingResponse};
use crate::telemetry::span::{ExchangeSpan, PhaseSpan};

/// `details` of a terminate verdict produced by a denial.
pub const DISALLOWED_DETAILS: &str = "disallowed policy decision response";

/// `details` of a terminate verdict the policy asked for while allowing.
pub const IMMEDIATE_DETAILS: &str = "allowed immediate policy decision response";

const CONVERSION_FAILED: &str = "failed to convert incoming message to policy input";
const EVALUATION_FAILED: &str = "failed to evaluate query";
const ALLOWED_FAILED: &str = "failed to get allowed value";
const BODY_FAILED: &str = "failed to get response body";
const STATUS_FAILED: &str = "failed to get response status";
const CONTEXT_FAILED: &str = "failed to get response context";
const MUTATION_FAILED: &str = "failed to get mutation response";

/// State carried from one phase to the next within a single exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeState {
    /// `:method` seen on request headers (empty until then)
    pub method: String,
    /// `:path` seen on request headers (empty until then)
    pub path: String,
    /// Policy-controlled value threaded into the next phase's input
    pub context: Option<Value>,
    pub tee_type: String,
    /// Last phase that was processed, used to spot out-of-order delivery
    pub last_phase: Option<Phase>,
}

/// A failed step: the fixed message the proxy sees plus the underlying cause.
struct PhaseFault {
    message: &'static str,
    error: FilterError,
}

fn fault(message: &'static str) -> impl FnOnce(FilterError) -> PhaseFault {
    move |error| PhaseFault { message, error }
}

/// Processes the phases of exactly one exchange.
#[derive(Debug)]
pub struct ExchangeProcessor {
    evaluator: Arc<PolicyEvaluator>,
    state: ExchangeState,
    telemetry: ExchangeSpan,
    /// Keep a `PhaseSpan` (decision and print output included) per phase.
    /// Off, the exchange record holds only the request line.
    record_phases: bool,
}

impl ExchangeProcessor {
    /// A processor that records every phase.
    pub fn new(evaluator: Arc<PolicyEvaluator>, tee_type: impl Into<String>) -> Self {
        let tee_type = tee_type.into();
        Self {
            evaluator,
            telemetry: ExchangeSpan::new(tee_type.clone()),
            state: ExchangeState {
                tee_type,
                ..ExchangeState::default()
            },
            record_phases: true,
        }
    }

    /// Turn per-phase records on or off. Streamed bodies arrive as one
    /// message per chunk, so records are only worth keeping when something
    /// will write them out.
    pub fn with_phase_records(mut self, enabled: bool) -> Self {
        self.record_phases = enabled;
        self
    }

    pub fn records_phases(&self) -> bool {
        self.record_phases
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// The ambient context the next phase will see.
    pub fn context(&self) -> Option<&Value> {
        self.state.context.as_ref()
    }

    pub fn telemetry(&self) -> &ExchangeSpan {
        &self.telemetry
    }

    /// End the exchange and hand back its finalized span.
    pub fn finish(mut self) -> ExchangeSpan {
        self.telemetry.finalize();
        self.telemetry
    }

    /// Dispatch one inbound message to its phase entry point.
    pub fn process(&mut self, request: &ProcessingRequest) -> ProcessingResponse {
        match &request.request {
            Request::RequestHeaders(_) => self.on_request_headers(request),
            Request::RequestBody(_) => self.on_request_body(request),
            Request::ResponseHeaders(_) => self.on_response_headers(request),
            Request::ResponseBody(_) => self.on_response_body(request),
            Request::RequestTrailers(_) => {
                debug!("Acknowledging request trailers without evaluation");
                builder::request_trailers_response()
            }
            Request::ResponseTrailers(_) => {
                debug!("Acknowledging response trailers without evaluation");
                builder::response_trailers_response()
            }
        }
    }

    /// Processes the request headers; records `:method` and `:path`.
    pub fn on_request_headers(&mut self, request: &ProcessingRequest) -> ProcessingResponse {
        self.respond(Phase::RequestHeaders, request)
    }

    /// Processes the request body; may rewrite it.
    pub fn on_request_body(&mut self, request: &ProcessingRequest) -> ProcessingResponse {
        self.respond(Phase::RequestBody, request)
    }

    pub fn on_response_headers(&mut self, request: &ProcessingRequest) -> ProcessingResponse {
        self.respond(Phase::ResponseHeaders, request)
    }

    /// Processes the response body; may rewrite it.
    pub fn on_response_body(&mut self, request: &ProcessingRequest) -> ProcessingResponse {
        self.respond(Phase::ResponseBody, request)
    }

    fn respond(&mut self, phase: Phase, request: &ProcessingRequest) -> ProcessingResponse {
        let verdict = self.decide(phase, request);
        builder::from_verdict(phase, &verdict)
    }

    /// Run one phase and return its verdict.
    ///
    /// Every call appends a [`PhaseSpan`] to the exchange telemetry. Failures
    /// are phase-local: the next phase runs with whatever context is held.
    pub fn decide(&mut self, phase: Phase, request: &ProcessingRequest) -> Verdict {
        let span = info_span!(
            "ext_proc_phase",
            phase = %phase,
            request.method = tracing::field::Empty,
            request.path = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
        );
        let _enter = span.enter();

        if let Some(last) = self.state.last_phase {
            if phase < last {
                warn!(
                    "Phase '{}' delivered after '{}' for {} '{}'",
                    phase, last, self.state.method, self.state.path
                );
            }
        }
        self.state.last_phase = Some(phase);

        let mut record = self.telemetry.start_phase(phase);
        let verdict = match self.run_phase(phase, request, &mut record) {
            Ok(verdict) => verdict,
            Err(PhaseFault { message, error }) => {
                error!("{}: {}", message, error.report());
                record.record_fault(&error);
                Verdict::error(message)
            }
        };

        if phase == Phase::RequestHeaders {
            span.record("request.method", self.state.method.as_str());
            span.record("request.path", self.state.path.as_str());
        }
        if record.is_failed() {
            span.record("otel.status_code", "ERROR");
        }

        debug!("Phase '{}' verdict: {}", phase, verdict.label());
        if self.record_phases {
            record.finalize(verdict.label());
            self.telemetry.add_phase(record);
        }
        verdict
    }

    fn run_phase(
        &mut self,
        phase: Phase,
        request: &ProcessingRequest,
        record: &mut PhaseSpan,
    ) -> Result<Verdict, PhaseFault> {
        if request.request.phase() != Some(phase) {
            return Err(PhaseFault {
                message: CONVERSION_FAILED,
                error: FilterError::Conversion(format!(
                    "'{}' cannot process a {} message",
                    phase,
                    request.request.kind()
                )),
            });
        }

        if let Some(headers) = request.headers().filter(|_| phase == Phase::RequestHeaders) {
            self.state.method = extract_header(METHOD_HEADER, headers);
            self.state.path = extract_header(PATH_HEADER, headers);
            self.telemetry.set_request(&self.state.method, &self.state.path);
        }

        if phase.is_body() {
            let direction = if phase == Phase::RequestBody {
                "request"
            } else {
                "response"
            };
            debug!(
                "Handling confidential {} '{}' {}",
                self.state.method, self.state.path, direction
            );
        }

        let input = build_input(request, self.state.context.as_ref(), &self.state.tee_type)
            .map_err(fault(CONVERSION_FAILED))?;

        info!(
            "Evaluating '{}' policy for {} '{}'",
            phase, self.state.method, self.state.path
        );
        if let Some(query) = self.evaluator.query_name(phase) {
            record.record_query(query);
        }
        let (decision, print_output) = self
            .evaluator
            .evaluate_with_output(phase, &input)
            .map_err(fault(EVALUATION_FAILED))?;
        if self.record_phases {
            record.record_print_output(print_output);
            record.record_decision(decision.value());
        }

        if !decision.is_allowed().map_err(fault(ALLOWED_FAILED))? {
            return disallowed(&decision, record);
        }

        if decision.is_immediate_response().map_err(fault(BODY_FAILED))? {
            let body = decision.response_body().map_err(fault(BODY_FAILED))?;
            return Ok(Verdict::Terminate {
                status: HttpStatus::OK.code,
                body,
                details: IMMEDIATE_DETAILS,
            });
        }

        if let Some(context) = decision.response_context().map_err(fault(CONTEXT_FAILED))? {
            self.state.context = Some(context);
        }

        let mutation = match request.body() {
            Some(body) => body_mutation(&decision, &body.body).map_err(fault(MUTATION_FAILED))?,
            None => None,
        };
        Ok(Verdict::Continue(mutation))
    }
}

fn disallowed(decision: &DecisionDocument, record: &mut PhaseSpan) -> Result<Verdict, PhaseFault> {
    let body = decision.response_body().map_err(fault(BODY_FAILED))?;
    let status = decision
        .response_http_status()
        .map_err(fault(STATUS_FAILED))?;

    warn!("Policy disallowed the exchange with status {}: {}", status, body);
    record.record_disallowed(&body);
    Ok(Verdict::Terminate {
        status,
        body,
        details: DISALLOWED_DETAILS,
    })
}

/// A rewrite when the policy returned a non-empty body that differs from
/// `original` byte for byte.
fn body_mutation(
    decision: &DecisionDocument,
    original: &[u8],
) -> crate::error::Result<Option<Mutation>> {
    let replacement = decision.response_body()?;
    if replacement.is_empty() || replacement.as_bytes() == original {
        return Ok(None);
    }
    Ok(Some(Mutation::replace_body(replacement.into_bytes())))
}
