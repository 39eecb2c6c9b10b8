//! Test helper functions for integration tests
//!
//! Shared across test files using the tests/common/ pattern. Not every test
//! binary uses every helper.
#![allow(dead_code)]

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use warden_core::engine::{PolicyEvaluator, PolicyQuery, QueryOutput};
use warden_core::protocol::{HttpBody, HttpHeaders, ProcessingRequest};
use warden_core::{Phase, PolicyFilter};

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

type Responder = dyn Fn(Phase, &Value) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// A query driven by a closure. Every input it sees is recorded.
pub struct FnQuery {
    phase: Phase,
    name: String,
    responder: Arc<Responder>,
    inputs: Arc<Mutex<Vec<(Phase, Value)>>>,
}

impl PolicyQuery for FnQuery {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, input: &Value) -> anyhow::Result<QueryOutput> {
        self.inputs
            .lock()
            .unwrap()
            .push((self.phase, input.clone()));
        Ok(QueryOutput {
            results: (self.responder)(self.phase, input)?,
            print_output: vec![format!("evaluated {}", self.phase)],
        })
    }
}

/// A policy filter whose every phase is answered by `responder`, plus a
/// handle on the inputs the policy received.
pub struct ScriptedPolicy {
    pub filter: PolicyFilter,
    inputs: Arc<Mutex<Vec<(Phase, Value)>>>,
}

impl ScriptedPolicy {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(Phase, &Value) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        let responder: Arc<Responder> = Arc::new(responder);
        let inputs = Arc::new(Mutex::new(Vec::new()));

        let queries: HashMap<Phase, Arc<dyn PolicyQuery>> = Phase::ALL
            .into_iter()
            .map(|phase| {
                let query: Arc<dyn PolicyQuery> = Arc::new(FnQuery {
                    phase,
                    name: phase.entrypoint("test.policy"),
                    responder: Arc::clone(&responder),
                    inputs: Arc::clone(&inputs),
                });
                (phase, query)
            })
            .collect();

        let evaluator = PolicyEvaluator::new(queries).unwrap();
        Self {
            filter: PolicyFilter::new(Arc::new(evaluator), "sevsnp").with_phase_records(true),
            inputs,
        }
    }

    /// Every phase returns `decision` as its single result.
    pub fn fixed(decision: Value) -> Self {
        Self::new(move |_, _| Ok(vec![decision.clone()]))
    }

    /// Inputs seen so far, in evaluation order.
    pub fn inputs(&self) -> Vec<(Phase, Value)> {
        self.inputs.lock().unwrap().clone()
    }

    /// The last input seen for `phase`.
    pub fn last_input(&self, phase: Phase) -> Option<Value> {
        self.inputs()
            .into_iter()
            .rev()
            .find(|(p, _)| *p == phase)
            .map(|(_, input)| input)
    }
}

pub fn request_headers(method: &str, path: &str) -> ProcessingRequest {
    ProcessingRequest::request_headers(HttpHeaders::from_pairs([
        (":method", method),
        (":path", path),
        ("content-type", "application/json"),
    ]))
}

pub fn request_body(body: impl Into<Vec<u8>>) -> ProcessingRequest {
    ProcessingRequest::request_body(HttpBody::new(body))
}

pub fn response_headers(status: &str) -> ProcessingRequest {
    ProcessingRequest::response_headers(HttpHeaders::from_pairs([(":status", status)]))
}

pub fn response_body(body: impl Into<Vec<u8>>) -> ProcessingRequest {
    ProcessingRequest::response_body(HttpBody::new(body))
}

/// The WAT fixture implementing the OPA ABI subset used by runtime tests.
pub fn opa_abi_fixture() -> &'static str {
    include_str!("../fixtures/opa_abi.wat")
}
