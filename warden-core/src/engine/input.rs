//! Input builder - turns one intercepted message into policy input.
//!
//! The whole `ProcessingRequest` is rendered with the protobuf JSON mapping so
//! a policy can inspect any part of it (headers, raw header bytes, body,
//! attributes, metadata). Two fields are injected at the top level:
//! `context` (the exchange's ambient context, `null` when unset) and
//! `teeType`.

use serde_json::Value;
use tracing::debug;

use crate::error::{FilterError, Result};
use crate::protocol::request::ProcessingRequest;

pub const CONTEXT_FIELD: &str = "context";
pub const TEE_TYPE_FIELD: &str = "teeType";

/// Build the input document for one evaluation.
pub fn build_input(
    request: &ProcessingRequest,
    context: Option<&Value>,
    tee_type: &str,
) -> Result<Value> {
    let mut input = serde_json::to_value(request)
        .map_err(|e| FilterError::Conversion(format!("failed to render message: {e}")))?;

    let fields = input.as_object_mut().ok_or_else(|| {
        FilterError::Conversion("message did not render as a JSON object".to_string())
    })?;

    fields.insert(
        CONTEXT_FIELD.to_string(),
        context.cloned().unwrap_or(Value::Null),
    );
    fields.insert(TEE_TYPE_FIELD.to_string(), Value::String(tee_type.to_string()));

    debug!("Query input: {}", input);
    Ok(input)
}
