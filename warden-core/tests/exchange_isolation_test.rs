//! Concurrent exchanges must never observe each other's ambient context.

mod common;

use common::*;
use serde_json::{json, Value};
use warden_core::Phase;

/// Stashes the request path as context on request headers and reports the
/// context it was given on every later phase.
fn path_stashing_policy() -> ScriptedPolicy {
    ScriptedPolicy::new(|phase, input| {
        let decision = match phase {
            Phase::RequestHeaders => {
                let path = input["requestHeaders"]["headers"]["headers"]
                    .as_array()
                    .and_then(|headers| headers.iter().find(|h| h["key"] == ":path"))
                    .map(|h| h["value"].clone())
                    .unwrap_or(Value::Null);
                json!({"allowed": true, "responseContext": {"path": path}})
            }
            _ => json!({"allowed": true}),
        };
        Ok(vec![decision])
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_exchanges_keep_their_own_context() {
    init_test_logging();
    let policy = path_stashing_policy();

    let mut handles = Vec::new();
    for i in 0..32 {
        let filter = policy.filter.clone();
        handles.push(tokio::spawn(async move {
            let path = format!("/tenant/{i}");
            let mut exchange = filter.new_exchange();

            exchange.process(&request_headers("GET", &path));
            tokio::task::yield_now().await;
            exchange.process(&request_body(format!("{{\"n\":{i}}}")));
            tokio::task::yield_now().await;
            exchange.process(&response_headers("200"));
            exchange.process(&response_body("{}"));

            let context = exchange.context().cloned();
            let span = filter.complete_exchange(exchange);
            (path, context, span.path)
        }));
    }

    for handle in handles {
        let (path, context, span_path) = handle.await.unwrap();
        assert_eq!(context, Some(json!({"path": path})));
        assert_eq!(span_path, path);
    }

    // Every non-header input carried the context of its own exchange
    let inputs = policy.inputs();
    assert_eq!(inputs.len(), 32 * 4);
    for (phase, input) in inputs {
        if phase == Phase::RequestHeaders {
            assert_eq!(input["context"], Value::Null);
        } else {
            assert!(input["context"]["path"]
                .as_str()
                .unwrap()
                .starts_with("/tenant/"));
        }
    }
}

#[tokio::test]
async fn test_body_input_sees_only_its_exchange_context() {
    init_test_logging();
    let policy = path_stashing_policy();

    let mut first = policy.filter.new_exchange();
    let mut second = policy.filter.new_exchange();

    first.process(&request_headers("GET", "/first"));
    second.process(&request_headers("GET", "/second"));
    first.process(&request_body("a"));
    second.process(&request_body("b"));

    let bodies: Vec<Value> = policy
        .inputs()
        .into_iter()
        .filter(|(phase, _)| *phase == Phase::RequestBody)
        .map(|(_, input)| input)
        .collect();

    assert_eq!(bodies[0]["context"], json!({"path": "/first"}));
    assert_eq!(bodies[1]["context"], json!({"path": "/second"}));
}

#[test]
fn test_new_exchange_starts_empty() {
    let policy = path_stashing_policy();

    let mut used = policy.filter.new_exchange();
    used.process(&request_headers("GET", "/used"));
    assert!(used.context().is_some());

    let fresh = policy.filter.new_exchange();
    assert_eq!(fresh.context(), None);
    assert_eq!(fresh.state().method, "");
    assert_eq!(fresh.state().tee_type, "sevsnp");
}
