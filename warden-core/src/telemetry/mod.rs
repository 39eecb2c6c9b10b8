//! Structured telemetry for the exchange lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! warden.exchange (ROOT - one per ExchangeProcessor)
//!   ├── method, path, tee_type, trace_id
//!   │
//!   └── warden.phase (CHILD - one per phase call)
//!         ├── phase, query, decision, print_output
//!         ├── verdict
//!         └── events: fault | disallowed
//! ```
//!
//! Faults and denials both mark the phase span failed; the event kind tells
//! them apart. Spans are written by [`TelemetryWriter`] once the exchange is
//! completed, when telemetry output is configured.

pub mod span;
pub mod writer;

pub use span::{ExchangeSpan, PhaseSpan, SpanEvent, SpanEventKind, SpanStatus};
pub use writer::TelemetryWriter;
