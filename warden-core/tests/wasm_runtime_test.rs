//! WASM runtime and filter start-up against the OPA ABI fixture module.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use warden_core::engine::wasm_runtime::WasmRuntime;
use warden_core::engine::{FilterConfig, PolicyEvaluator, Verdict};
use warden_core::{FilterError, Phase, PolicyFilter};

fn runtime() -> WasmRuntime {
    WasmRuntime::new(opa_abi_fixture().as_bytes()).unwrap()
}

#[test]
fn test_entrypoints_are_resolved() {
    init_test_logging();
    let runtime = runtime();

    assert_eq!(runtime.entrypoints().len(), 5);
    assert_eq!(runtime.entrypoint_id("test/on_request_headers"), Some(0));
    assert_eq!(runtime.entrypoint_id("test/on_request_body"), Some(3));
    assert_eq!(runtime.entrypoint_id("test/missing"), None);
}

#[test]
fn test_single_result() {
    init_test_logging();
    let evaluation = runtime().evaluate(0, &json!({})).unwrap();

    assert_eq!(
        evaluation.results,
        vec![json!({"allowed": true, "responseBody": "ok"})]
    );
    assert_eq!(evaluation.print_output, vec!["fixture eval".to_string()]);
}

#[test]
fn test_undefined_and_ambiguous_result_sets() {
    init_test_logging();
    let runtime = runtime();

    assert!(runtime.evaluate(1, &json!({})).unwrap().results.is_empty());
    assert_eq!(runtime.evaluate(2, &json!({})).unwrap().results.len(), 2);
}

#[test]
fn test_input_reaches_policy_unchanged() {
    init_test_logging();
    let input = json!({
        "requestBody": {"body": "//4A", "endOfStream": true},
        "context": {"tenant": "a"},
        "teeType": "sevsnp"
    });

    let evaluation = runtime().evaluate(3, &input).unwrap();
    assert_eq!(evaluation.results, vec![input]);
}

#[test]
fn test_print_output_is_per_call() {
    init_test_logging();
    let runtime = runtime();

    for _ in 0..3 {
        let evaluation = runtime.evaluate(0, &json!({})).unwrap();
        assert_eq!(evaluation.print_output.len(), 1);
    }
}

#[test]
fn test_abort_is_an_error() {
    init_test_logging();
    let err = runtime().evaluate(4, &json!({})).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("opa_eval failed for entrypoint 4"), "{message}");
    assert!(message.contains("policy panicked"), "{message}");
}

#[test]
fn test_bundle_data_is_accepted() {
    init_test_logging();
    let data = json!({"tenants": ["a", "b"]});
    let runtime =
        WasmRuntime::new_with_config(opa_abi_fixture().as_bytes(), Some(&data), Some(2 << 20))
            .unwrap();

    let evaluation = runtime.evaluate(0, &json!({})).unwrap();
    assert_eq!(evaluation.results.len(), 1);
}

#[test]
fn test_invalid_module_is_rejected() {
    let err = WasmRuntime::new(b"not a module").unwrap_err();
    assert!(format!("{err:#}").contains("Failed to load WASM module"));
}

#[test]
fn test_evaluator_requires_every_phase_entrypoint() {
    init_test_logging();
    let runtime = Arc::new(runtime());

    assert!(PolicyEvaluator::from_runtime(Arc::clone(&runtime), "test").is_ok());

    let err = PolicyEvaluator::from_runtime(runtime, "cleanroom.policy").unwrap_err();
    let message = format!("{err:#}");
    assert!(
        message.contains("no entrypoint 'cleanroom/policy/on_request_headers'"),
        "{message}"
    );
}

#[test]
fn test_evaluator_maps_result_sets_to_errors() {
    init_test_logging();
    let evaluator = PolicyEvaluator::from_runtime(Arc::new(runtime()), "test").unwrap();

    let decision = evaluator.evaluate(Phase::RequestHeaders, &json!({})).unwrap();
    assert!(decision.is_allowed().unwrap());

    assert!(matches!(
        evaluator.evaluate(Phase::ResponseHeaders, &json!({})),
        Err(FilterError::UndefinedResult { .. })
    ));
    assert!(matches!(
        evaluator.evaluate(Phase::ResponseBody, &json!({})),
        Err(FilterError::AmbiguousResult { count: 2, .. })
    ));
}

#[tokio::test]
async fn test_filter_from_config_runs_exchange() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("policy.wat");
    std::fs::write(&module, opa_abi_fixture()).unwrap();

    let mut config = FilterConfig::for_bundle(&module);
    config.policy.package = "test".to_string();
    config.tee_type = "tdx".to_string();
    config.telemetry.enabled = true;
    config.telemetry.destination = Some(dir.path().join("telemetry"));

    let filter = PolicyFilter::from_config(&config).await.unwrap();
    assert_eq!(filter.tee_type(), "tdx");

    let mut exchange = filter.new_exchange();
    assert_eq!(
        exchange.decide(Phase::RequestHeaders, &request_headers("GET", "/")),
        Verdict::Continue(None)
    );
    // The echoed input has no `allowed` field
    assert_eq!(
        exchange.decide(Phase::RequestBody, &request_body("{}")),
        Verdict::error("failed to get allowed value")
    );
    assert_eq!(
        exchange.decide(Phase::ResponseHeaders, &response_headers("200")),
        Verdict::error("failed to evaluate query")
    );

    let span = filter.complete_exchange(exchange);
    assert_eq!(span.tee_type, "tdx");
    assert_eq!(span.phases.len(), 3);
    assert_eq!(span.phases[0].print_output, vec!["fixture eval".to_string()]);

    let written = std::fs::read_dir(dir.path().join("telemetry")).unwrap().count();
    assert_eq!(written, 1);
}

#[tokio::test]
async fn test_filter_without_telemetry_output_keeps_no_phase_records() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("policy.wat");
    std::fs::write(&module, opa_abi_fixture()).unwrap();

    let mut config = FilterConfig::for_bundle(&module);
    config.policy.package = "test".to_string();

    let filter = PolicyFilter::from_config(&config).await.unwrap();
    let mut exchange = filter.new_exchange();
    assert!(!exchange.records_phases());

    exchange.decide(Phase::RequestHeaders, &request_headers("POST", "/upload"));
    for _ in 0..50 {
        exchange.decide(Phase::RequestBody, &request_body("chunk"));
    }

    let span = filter.complete_exchange(exchange);
    assert!(span.phases.is_empty());
    assert_eq!(span.path, "/upload");
}

#[tokio::test]
async fn test_filter_from_config_rejects_wrong_package() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("policy.wat");
    std::fs::write(&module, opa_abi_fixture()).unwrap();

    let config = FilterConfig::for_bundle(&module);
    let err = PolicyFilter::from_config(&config).await.unwrap_err();
    assert!(format!("{err:#}").contains("does not provide every phase rule"));
}
