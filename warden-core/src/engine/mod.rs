//! The Warden engine - policy evaluation for the ext_proc data path.
//!
//! [`PolicyFilter`] is built once at start-up from a [`FilterConfig`]: it
//! loads the policy bundle, instantiates the WASM runtime and prepares one
//! query per phase. After that it only hands out [`ExchangeProcessor`]s, one
//! per intercepted exchange, and collects their telemetry when they finish.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// Policy loading
pub mod compiler;
pub mod config;
pub mod wasm_runtime;

// Per-exchange pipeline
pub mod decision;
pub mod evaluator;
pub mod input;
pub mod phase;
pub mod processor;
pub mod verdict;

pub use config::{FilterConfig, PolicySource, TelemetryConfig, TelemetryFormat};
pub use decision::DecisionDocument;
pub use evaluator::{PolicyEvaluator, PolicyQuery, QueryOutput, WasmQuery};
pub use phase::Phase;
pub use processor::{ExchangeProcessor, ExchangeState};
pub use verdict::{Mutation, Verdict};

use crate::telemetry::{ExchangeSpan, TelemetryWriter};
use compiler::PolicyBundle;
use wasm_runtime::WasmRuntime;

/// Long-lived filter: shared evaluator plus per-process settings.
#[derive(Debug, Clone)]
pub struct PolicyFilter {
    evaluator: Arc<PolicyEvaluator>,
    tee_type: String,
    telemetry: TelemetryConfig,
    record_phases: bool,
}

impl PolicyFilter {
    /// Wrap an already prepared evaluator. Telemetry output and phase
    /// records are off.
    pub fn new(evaluator: Arc<PolicyEvaluator>, tee_type: impl Into<String>) -> Self {
        Self {
            evaluator,
            tee_type: tee_type.into(),
            telemetry: TelemetryConfig::default(),
            record_phases: false,
        }
    }

    /// Set telemetry output. Exchanges keep phase records exactly when the
    /// output has somewhere to go.
    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.record_phases = telemetry.output_dir().is_some();
        self.telemetry = telemetry;
        self
    }

    /// Keep phase records regardless of telemetry output, for callers that
    /// inspect finished exchanges themselves.
    pub fn with_phase_records(mut self, enabled: bool) -> Self {
        self.record_phases = enabled;
        self
    }

    /// Load the configured bundle and prepare every phase query.
    ///
    /// Any failure here is fatal to the process, never to an exchange.
    pub async fn from_config(config: &FilterConfig) -> Result<Self> {
        let start = Instant::now();
        info!("Initializing policy filter");

        let bundle = PolicyBundle::load(
            &config.policy.bundle,
            &config.policy.package,
            config.opa_path.as_deref(),
        )
        .await
        .context("Failed to load policy bundle")?;

        let runtime = WasmRuntime::new_with_config(
            &bundle.wasm,
            bundle.data.as_ref(),
            config.wasm_max_memory,
        )
        .context("Failed to initialize WASM runtime")?;

        let evaluator = PolicyEvaluator::from_runtime(Arc::new(runtime), &config.policy.package)
            .with_context(|| {
                format!(
                    "Policy package '{}' does not provide every phase rule",
                    config.policy.package
                )
            })?;

        info!(
            "Policy filter ready in {}ms (package: {}, tee: {})",
            start.elapsed().as_millis(),
            config.policy.package,
            config.tee_type
        );

        Ok(Self::new(Arc::new(evaluator), config.tee_type.clone())
            .with_telemetry(config.telemetry.clone()))
    }

    pub fn evaluator(&self) -> &Arc<PolicyEvaluator> {
        &self.evaluator
    }

    pub fn tee_type(&self) -> &str {
        &self.tee_type
    }

    /// A fresh processor for one exchange. Shares nothing mutable with any
    /// other processor.
    pub fn new_exchange(&self) -> ExchangeProcessor {
        ExchangeProcessor::new(Arc::clone(&self.evaluator), self.tee_type.clone())
            .with_phase_records(self.record_phases)
    }

    /// Finish an exchange, writing its telemetry if output is configured.
    ///
    /// A write failure is logged and otherwise ignored; telemetry never
    /// changes what the proxy was told.
    pub fn complete_exchange(&self, processor: ExchangeProcessor) -> ExchangeSpan {
        let span = processor.finish();
        debug!(
            "Exchange {} completed: {} phases in {}ms",
            span.trace_id,
            span.phases.len(),
            span.total_duration_ms
        );

        if let Some(destination) = self.telemetry.output_dir() {
            match TelemetryWriter::write_exchange(&span, self.telemetry.format, destination) {
                Ok(path) => debug!("Wrote exchange telemetry to {:?}", path),
                Err(e) => warn!("Failed to write exchange telemetry: {:#}", e),
            }
        }
        span
    }
}
