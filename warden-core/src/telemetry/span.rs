//! Telemetry span types for the exchange lifecycle.
//!
//! ```text
//! ExchangeSpan (root - one intercepted request/response cycle)
//!   ├── method, path, tee_type, trace_id
//!   │
//!   └── phases: Vec<PhaseSpan> (one per phase invocation)
//!         ├── phase, query
//!         ├── print_output, decision
//!         ├── verdict
//!         └── events (fault | disallowed), status
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::engine::phase::Phase;
use crate::error::FilterError;

/// The random tail of a v7 UUID, hex encoded.
fn generate_span_id() -> String {
    let uuid = Uuid::now_v7();
    hex::encode(&uuid.as_bytes()[8..16])
}

/// Generate a trace ID (UUID v7, time-ordered).
pub fn generate_trace_id() -> String {
    Uuid::now_v7().to_string()
}

/// Nanoseconds since the Unix epoch, 0 before it.
fn system_time_to_nanos(time: &SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// RFC3339, matching what the text writer prints.
fn serialize_system_time<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use chrono::{DateTime, Utc};
    let datetime: DateTime<Utc> = (*time).into();
    serializer.serialize_str(&datetime.to_rfc3339())
}

fn deserialize_system_time<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use chrono::{DateTime, Utc};
    let text = String::deserialize(deserializer)?;
    let datetime: DateTime<Utc> = text.parse().map_err(serde::de::Error::custom)?;
    Ok(datetime.into())
}

/// Root span for one exchange. Created with the exchange processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSpan {
    /// Unique span identifier (16-char hex)
    pub span_id: String,

    /// Trace identifier for correlation (UUID v7, time-ordered)
    pub trace_id: String,

    pub start_time_unix_nano: u64,

    /// Set by `finalize`
    pub end_time_unix_nano: u64,

    #[serde(
        serialize_with = "serialize_system_time",
        deserialize_with = "deserialize_system_time"
    )]
    pub timestamp: SystemTime,

    /// `:method` of the intercepted request (empty until request headers)
    #[serde(default)]
    pub method: String,

    /// `:path` of the intercepted request (empty until request headers)
    #[serde(default)]
    pub path: String,

    pub tee_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseSpan>,

    pub total_duration_ms: u64,

    #[serde(skip)]
    start_instant: Option<Instant>,
}

impl ExchangeSpan {
    pub fn new(tee_type: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            span_id: generate_span_id(),
            trace_id: generate_trace_id(),
            start_time_unix_nano: system_time_to_nanos(&now),
            end_time_unix_nano: 0,
            timestamp: now,
            method: String::new(),
            path: String::new(),
            tee_type: tee_type.into(),
            phases: Vec::new(),
            total_duration_ms: 0,
            start_instant: Some(Instant::now()),
        }
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Record the request line once it is known.
    pub fn set_request(&mut self, method: &str, path: &str) {
        self.method = method.to_string();
        self.path = path.to_string();
    }

    /// Open a child span for a phase invocation.
    pub fn start_phase(&self, phase: Phase) -> PhaseSpan {
        PhaseSpan::new(phase, self.span_id.clone())
    }

    pub fn add_phase(&mut self, phase: PhaseSpan) {
        self.phases.push(phase);
    }

    pub fn last_phase(&self) -> Option<&PhaseSpan> {
        self.phases.last()
    }

    /// True if any phase of this exchange was marked failed.
    pub fn has_failures(&self) -> bool {
        self.phases.iter().any(PhaseSpan::is_failed)
    }

    pub fn finalize(&mut self) {
        self.end_time_unix_nano = system_time_to_nanos(&SystemTime::now());
        if let Some(start) = self.start_instant.take() {
            self.total_duration_ms = start.elapsed().as_millis() as u64;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanEventKind {
    /// Internal failure: conversion, evaluation or malformed decision.
    Fault,
    /// A policy said no. Not a filter failure, but still marks the span.
    Disallowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub kind: SpanEventKind,

    /// Error kind for faults, absent for denials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub message: String,
}

/// One phase invocation within an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpan {
    pub span_id: String,

    /// Parent span ID (ExchangeSpan.span_id)
    pub parent_span_id: String,

    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,

    pub phase: Phase,

    /// Query that was evaluated, if evaluation was reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub print_output: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Value>,

    /// Verdict label (continue, continue_with_mutation, terminate, error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SpanEvent>,

    #[serde(default)]
    pub status: SpanStatus,

    pub duration_ms: u64,

    #[serde(skip)]
    start_instant: Option<Instant>,
}

impl PhaseSpan {
    pub fn new(phase: Phase, parent_span_id: String) -> Self {
        Self {
            span_id: generate_span_id(),
            parent_span_id,
            start_time_unix_nano: system_time_to_nanos(&SystemTime::now()),
            end_time_unix_nano: 0,
            phase,
            query: None,
            print_output: Vec::new(),
            decision: None,
            verdict: None,
            events: Vec::new(),
            status: SpanStatus::Unset,
            duration_ms: 0,
            start_instant: Some(Instant::now()),
        }
    }

    pub fn record_query(&mut self, query: impl Into<String>) {
        self.query = Some(query.into());
    }

    pub fn record_print_output(&mut self, lines: Vec<String>) {
        self.print_output = lines;
    }

    pub fn record_decision(&mut self, decision: &Value) {
        self.decision = Some(decision.clone());
    }

    /// Mark the span failed because the filter itself failed.
    pub fn record_fault(&mut self, error: &FilterError) {
        self.events.push(SpanEvent {
            kind: SpanEventKind::Fault,
            error: Some(error.kind().to_string()),
            message: error.report(),
        });
        self.status = SpanStatus::Error;
    }

    /// Mark the span failed because the policy denied the exchange.
    pub fn record_disallowed(&mut self, body: &str) {
        self.events.push(SpanEvent {
            kind: SpanEventKind::Disallowed,
            error: None,
            message: body.to_string(),
        });
        self.status = SpanStatus::Error;
    }

    pub fn is_failed(&self) -> bool {
        self.status == SpanStatus::Error
    }

    pub fn has_event(&self, kind: SpanEventKind) -> bool {
        self.events.iter().any(|e| e.kind == kind)
    }

    /// Close the span with the verdict that was returned.
    pub fn finalize(&mut self, verdict: &str) {
        self.verdict = Some(verdict.to_string());
        if self.status == SpanStatus::Unset {
            self.status = SpanStatus::Ok;
        }
        self.end_time_unix_nano = system_time_to_nanos(&SystemTime::now());
        if let Some(start) = self.start_instant.take() {
            self.duration_ms = start.elapsed().as_millis() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_ids() {
        let span = ExchangeSpan::new("sevsnp");
        assert_eq!(span.span_id().len(), 16);
        assert!(Uuid::parse_str(&span.trace_id).is_ok());

        let phase = span.start_phase(Phase::RequestHeaders);
        assert_eq!(phase.parent_span_id, span.span_id);
        assert_ne!(phase.span_id, span.span_id);
    }

    #[test]
    fn test_fault_marks_failed() {
        let span = ExchangeSpan::new("none");
        let mut phase = span.start_phase(Phase::RequestBody);
        phase.record_fault(&FilterError::Evaluation {
            query: "q".to_string(),
            source: anyhow::anyhow!("trap"),
        });
        phase.finalize("error");

        assert!(phase.is_failed());
        assert!(phase.has_event(SpanEventKind::Fault));
        assert_eq!(phase.events[0].error.as_deref(), Some("evaluation"));
        assert_eq!(
            phase.events[0].message,
            "policy query 'q' failed to evaluate: trap"
        );
    }

    #[test]
    fn test_clean_phase_is_ok() {
        let mut exchange = ExchangeSpan::new("none");
        let mut phase = exchange.start_phase(Phase::ResponseHeaders);
        phase.finalize("continue");
        assert_eq!(phase.status, SpanStatus::Ok);

        exchange.add_phase(phase);
        exchange.finalize();
        assert!(!exchange.has_failures());
        assert!(exchange.end_time_unix_nano >= exchange.start_time_unix_nano);
    }

    #[test]
    fn test_span_json_round_trip() {
        let mut exchange = ExchangeSpan::new("sevsnp");
        exchange.set_request("GET", "/data");
        let mut phase = exchange.start_phase(Phase::RequestHeaders);
        phase.record_disallowed("forbidden");
        phase.finalize("terminate");
        exchange.add_phase(phase);

        let json = serde_json::to_string(&exchange).unwrap();
        let back: ExchangeSpan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, "/data");
        assert!(back.has_failures());
        assert!(back.phases[0].has_event(SpanEventKind::Disallowed));
    }
}
