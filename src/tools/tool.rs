//! Tool trait: callables the model may invoke mid-conversation.

use crate::error::ToolError;

/// Output of a successful tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: serde_json::Value,
}

impl ToolOutput {
    pub fn json(result: serde_json::Value) -> Self {
        Self { result }
    }
}

/// A synchronous tool exposed to the model.
///
/// Tools run inside the conversation turn that requested them and must not
/// touch shared mutable state.
pub trait Tool: Send + Sync {
    /// Name the model calls the tool by.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the model-supplied parameters.
    fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError>;
}

/// Extract a required field from tool parameters.
pub fn require_field<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    field: &str,
) -> Result<&'a serde_json::Value, ToolError> {
    params
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing '{field}' parameter"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_field_rejects_null_and_missing() {
        let params = serde_json::json!({"skills": null, "other": 1});
        assert!(require_field("t", &params, "skills").is_err());
        assert!(require_field("t", &params, "absent").is_err());
        assert_eq!(require_field("t", &params, "other").unwrap(), &serde_json::json!(1));
    }
}
