//! Evaluator adapter - one prepared query per phase.
//!
//! Queries are prepared once when the filter starts; a missing query is a
//! start-up failure, never a per-exchange one. Per call the adapter insists
//! on exactly one result: zero or several are reported as evaluator
//! misconfiguration instead of being read as allow or deny.

use anyhow::{bail, Context};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::decision::DecisionDocument;
use super::phase::Phase;
use super::wasm_runtime::{Evaluation, WasmRuntime};
use crate::error::{FilterError, Result};

/// Raw output of one query run: result values plus diagnostic print lines.
pub type QueryOutput = Evaluation;

/// A compiled policy query that can be run against an input document.
pub trait PolicyQuery: Send + Sync {
    /// Name used in logs and errors (the entrypoint path).
    fn name(&self) -> &str;

    /// Run the query with `input` as the only evaluation input.
    fn evaluate(&self, input: &Value) -> anyhow::Result<QueryOutput>;
}

/// A query backed by one entrypoint of a shared [`WasmRuntime`].
#[derive(Debug, Clone)]
pub struct WasmQuery {
    runtime: Arc<WasmRuntime>,
    entrypoint: String,
    entrypoint_id: i32,
}

impl WasmQuery {
    /// Resolve `entrypoint` in the runtime's module.
    pub fn prepare(runtime: Arc<WasmRuntime>, entrypoint: &str) -> anyhow::Result<Self> {
        let Some(entrypoint_id) = runtime.entrypoint_id(entrypoint) else {
            let mut known: Vec<&String> = runtime.entrypoints().keys().collect();
            known.sort();
            bail!(
                "Policy module has no entrypoint '{}' (available: {:?})",
                entrypoint,
                known
            );
        };

        Ok(Self {
            runtime,
            entrypoint: entrypoint.to_string(),
            entrypoint_id,
        })
    }
}

impl PolicyQuery for WasmQuery {
    fn name(&self) -> &str {
        &self.entrypoint
    }

    fn evaluate(&self, input: &Value) -> anyhow::Result<QueryOutput> {
        self.runtime.evaluate(self.entrypoint_id, input)
    }
}

/// Holds the prepared query for every phase.
pub struct PolicyEvaluator {
    queries: HashMap<Phase, Arc<dyn PolicyQuery>>,
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<(Phase, &str)> =
            self.queries.iter().map(|(p, q)| (*p, q.name())).collect();
        names.sort();
        f.debug_struct("PolicyEvaluator")
            .field("queries", &names)
            .finish()
    }
}

impl PolicyEvaluator {
    /// Build from explicit queries. Every phase must have one.
    pub fn new(queries: HashMap<Phase, Arc<dyn PolicyQuery>>) -> anyhow::Result<Self> {
        for phase in Phase::ALL {
            if !queries.contains_key(&phase) {
                bail!("No policy query prepared for phase '{}'", phase);
            }
        }
        Ok(Self { queries })
    }

    /// Prepare one [`WasmQuery`] per phase from the entrypoints under `package`.
    pub fn from_runtime(runtime: Arc<WasmRuntime>, package: &str) -> anyhow::Result<Self> {
        let mut queries: HashMap<Phase, Arc<dyn PolicyQuery>> = HashMap::new();
        for phase in Phase::ALL {
            let entrypoint = phase.entrypoint(package);
            let query = WasmQuery::prepare(Arc::clone(&runtime), &entrypoint)
                .with_context(|| format!("Failed to prepare query for phase '{phase}'"))?;
            debug!("Prepared '{}' as entrypoint {}", phase, entrypoint);
            queries.insert(phase, Arc::new(query));
        }
        Self::new(queries)
    }

    /// Name of the query prepared for `phase`.
    pub fn query_name(&self, phase: Phase) -> Option<&str> {
        self.queries.get(&phase).map(|q| q.name())
    }

    /// Run the phase's query and return its single decision.
    pub fn evaluate(&self, phase: Phase, input: &Value) -> Result<DecisionDocument> {
        self.evaluate_with_output(phase, input).map(|(decision, _)| decision)
    }

    /// Like [`evaluate`](Self::evaluate), also handing back the policy's
    /// print output from this call.
    #[instrument(name = "policy_evaluate", skip_all, fields(phase = %phase))]
    pub fn evaluate_with_output(
        &self,
        phase: Phase,
        input: &Value,
    ) -> Result<(DecisionDocument, Vec<String>)> {
        let query = self
            .queries
            .get(&phase)
            .ok_or_else(|| FilterError::Evaluation {
                query: phase.query_name().to_string(),
                source: anyhow::anyhow!("no query prepared for phase"),
            })?;
        let name = query.name();

        let output = query.evaluate(input).map_err(|source| FilterError::Evaluation {
            query: name.to_string(),
            source,
        })?;

        if !output.print_output.is_empty() {
            info!(
                "'{}' policy print output:\n{}",
                phase,
                output.print_output.join("\n")
            );
        }

        let mut results = output.results;
        match results.len() {
            0 => Err(FilterError::UndefinedResult {
                query: name.to_string(),
            }),
            1 => {
                let decision = results.remove(0);
                info!("Got result/decision: {}", decision);
                Ok((DecisionDocument::new(decision), output.print_output))
            }
            count => Err(FilterError::AmbiguousResult {
                query: name.to_string(),
                count,
            }),
        }
    }
}
