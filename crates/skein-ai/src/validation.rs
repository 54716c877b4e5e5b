// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Schema-driven validation of tool-call arguments.
//!
//! Compiled against the `schema-validation` feature this checks arguments
//! against the tool's JSON Schema and reports path-qualified failures.
//! Without the feature the arguments pass through unchanged, so a build
//! without schema tooling degrades open rather than rejecting every call.

use serde_json::{Map, Value};

use crate::types::{Tool, ToolCall};

/// Tool-argument validation failure.  Treated by the agent loop as a tool
/// execution error: it fails the one call, never the turn.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolValidationError {
    #[error("Tool \"{name}\" not found")]
    ToolNotFound { name: String },
    #[error("Validation failed for tool \"{name}\":\n{details}\n\nReceived arguments:\n{arguments}")]
    InvalidArguments {
        name: String,
        /// One `  - path: message` line per violation.
        details: String,
        arguments: String,
    },
}

/// Find `call.name` among `tools` and validate its arguments.
pub fn validate_tool_call(
    tools: &[Tool],
    call: &ToolCall,
) -> Result<Map<String, Value>, ToolValidationError> {
    let tool = tools
        .iter()
        .find(|t| t.name == call.name)
        .ok_or_else(|| ToolValidationError::ToolNotFound { name: call.name.clone() })?;
    validate_tool_arguments(tool, call)
}

/// Validate `call.arguments` against `tool.parameters`.
///
/// Returns the arguments on success.  A schema that itself fails to
/// compile is treated as "no schema": the arguments pass through.
#[cfg(feature = "schema-validation")]
pub fn validate_tool_arguments(
    tool: &Tool,
    call: &ToolCall,
) -> Result<Map<String, Value>, ToolValidationError> {
    let validator = match jsonschema::validator_for(&tool.parameters) {
        Ok(v) => v,
        Err(error) => {
            tracing::warn!(tool = %tool.name, %error, "tool schema does not compile; skipping validation");
            return Ok(call.arguments.clone());
        }
    };

    let instance = Value::Object(call.arguments.clone());
    let lines: Vec<String> = validator
        .iter_errors(&instance)
        .map(|error| format!("  - {}: {}", dotted_path(&error.instance_path().to_string()), error))
        .collect();

    if lines.is_empty() {
        return Ok(call.arguments.clone());
    }

    Err(ToolValidationError::InvalidArguments {
        name: tool.name.clone(),
        details: lines.join("\n"),
        arguments: serde_json::to_string_pretty(&instance).unwrap_or_else(|_| "{}".into()),
    })
}

#[cfg(not(feature = "schema-validation"))]
pub fn validate_tool_arguments(
    _tool: &Tool,
    call: &ToolCall,
) -> Result<Map<String, Value>, ToolValidationError> {
    Ok(call.arguments.clone())
}

/// `"/a/0/b"` → `"a.0.b"`; the schema root becomes `"root"`.
#[cfg(feature = "schema-validation")]
fn dotted_path(pointer: &str) -> String {
    let dotted = pointer.trim_start_matches('/').replace('/', ".");
    if dotted.is_empty() {
        "root".into()
    } else {
        dotted
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
