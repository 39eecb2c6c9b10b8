//! Decision document - typed accessors over the value a policy query returns.
//!
//! Policies hand back an arbitrary JSON value. Only the fields below are
//! interpreted, each with an explicit shape check:
//!
//! | field                | type    | when absent               |
//! |----------------------|---------|---------------------------|
//! | `allowed`            | bool    | error (malformed policy)  |
//! | `isImmediateResponse`| bool    | `false`                   |
//! | `responseBody`       | string  | `""`                      |
//! | `responseContext`    | any     | `None` (null too)         |
//! | `responseHttpStatus` | integer | error, only read on deny  |

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{FilterError, Result};

const ALLOWED: &str = "allowed";
const IS_IMMEDIATE_RESPONSE: &str = "isImmediateResponse";
const RESPONSE_BODY: &str = "responseBody";
const RESPONSE_CONTEXT: &str = "responseContext";
const RESPONSE_HTTP_STATUS: &str = "responseHttpStatus";

/// The structured verdict returned by one phase evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DecisionDocument {
    value: Value,
}

impl DecisionDocument {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// The raw decision value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the exchange may proceed. Absence is an error, not a default
    /// deny: it means the policy is broken rather than that it decided.
    pub fn is_allowed(&self) -> Result<bool> {
        match self.field(ALLOWED)? {
            Some(Value::Bool(allowed)) => Ok(*allowed),
            Some(other) => Err(wrong_type(ALLOWED, "a boolean", other)),
            None => Err(FilterError::malformed(ALLOWED, "field is missing")),
        }
    }

    /// Whether the policy asks to short-circuit with its own response.
    pub fn is_immediate_response(&self) -> Result<bool> {
        match self.field(IS_IMMEDIATE_RESPONSE)? {
            Some(Value::Bool(immediate)) => Ok(*immediate),
            Some(other) => Err(wrong_type(IS_IMMEDIATE_RESPONSE, "a boolean", other)),
            None => Ok(false),
        }
    }

    pub fn response_body(&self) -> Result<String> {
        match self.field(RESPONSE_BODY)? {
            Some(Value::String(body)) => Ok(body.clone()),
            Some(other) => Err(wrong_type(RESPONSE_BODY, "a string", other)),
            None => Ok(String::new()),
        }
    }

    /// State the policy wants threaded into the next phase. Null counts as
    /// absent.
    pub fn response_context(&self) -> Result<Option<Value>> {
        match self.field(RESPONSE_CONTEXT)? {
            Some(Value::Null) | None => Ok(None),
            Some(context) => Ok(Some(context.clone())),
        }
    }

    /// HTTP status for a denial response.
    pub fn response_http_status(&self) -> Result<u16> {
        let value = self
            .field(RESPONSE_HTTP_STATUS)?
            .ok_or_else(|| FilterError::malformed(RESPONSE_HTTP_STATUS, "field is missing"))?;

        let code = value
            .as_u64()
            .ok_or_else(|| wrong_type(RESPONSE_HTTP_STATUS, "an integer", value))?;

        match u16::try_from(code) {
            Ok(code) if (100..=599).contains(&code) => Ok(code),
            _ => Err(FilterError::malformed(
                RESPONSE_HTTP_STATUS,
                format!("{code} is not a valid HTTP status code"),
            )),
        }
    }

    fn object(&self) -> Result<&Map<String, Value>> {
        self.value.as_object().ok_or_else(|| {
            FilterError::malformed(
                "decision",
                format!("expected an object, got {}", type_name(&self.value)),
            )
        })
    }

    fn field(&self, name: &str) -> Result<Option<&Value>> {
        Ok(self.object()?.get(name))
    }
}

impl From<Value> for DecisionDocument {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

fn wrong_type(field: &'static str, expected: &str, got: &Value) -> FilterError {
    FilterError::malformed(field, format!("expected {expected}, got {}", type_name(got)))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> DecisionDocument {
        DecisionDocument::new(value)
    }

    #[test]
    fn test_allowed_is_required() {
        assert!(doc(json!({"allowed": true})).is_allowed().unwrap());
        assert!(!doc(json!({"allowed": false})).is_allowed().unwrap());

        let err = doc(json!({"responseBody": "x"})).is_allowed().unwrap_err();
        assert!(matches!(
            err,
            FilterError::MalformedDecision { field: "allowed", .. }
        ));

        let err = doc(json!({"allowed": "yes"})).is_allowed().unwrap_err();
        assert!(err.to_string().contains("expected a boolean, got string"));
    }

    #[test]
    fn test_optional_fields_default() {
        let d = doc(json!({"allowed": true}));
        assert!(!d.is_immediate_response().unwrap());
        assert_eq!(d.response_body().unwrap(), "");
        assert_eq!(d.response_context().unwrap(), None);
    }

    #[test]
    fn test_optional_fields_type_checked() {
        let d = doc(json!({"allowed": true, "isImmediateResponse": 1, "responseBody": 5}));
        assert!(d.is_immediate_response().is_err());
        assert!(d.response_body().is_err());
    }

    #[test]
    fn test_null_context_is_absent() {
        let d = doc(json!({"allowed": true, "responseContext": null}));
        assert_eq!(d.response_context().unwrap(), None);

        let d = doc(json!({"allowed": true, "responseContext": {"tenant": "a"}}));
        assert_eq!(d.response_context().unwrap(), Some(json!({"tenant": "a"})));
    }

    #[test]
    fn test_http_status() {
        let d = doc(json!({"allowed": false, "responseHttpStatus": 403}));
        assert_eq!(d.response_http_status().unwrap(), 403);

        for bad in [json!(null), json!("403"), json!(-1), json!(4.5), json!(70000), json!(42)] {
            let d = doc(json!({"allowed": false, "responseHttpStatus": bad}));
            assert!(d.response_http_status().is_err(), "accepted {bad}");
        }

        let d = doc(json!({"allowed": false}));
        assert!(d.response_http_status().is_err());
    }

    #[test]
    fn test_non_object_decision() {
        let err = doc(json!(true)).is_allowed().unwrap_err();
        assert!(err.to_string().contains("expected an object, got boolean"));
    }
}
