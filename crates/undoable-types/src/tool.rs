use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ActionCategory;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// What a tool hands back to the pipeline: the model-facing output, optional
/// metadata for events, and the inverse payload the tool can later apply to
/// reverse the effect.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub output: String,
    pub metadata: Value,
    pub inverse: Option<Value>,
}

impl ToolOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: Value::Null,
            inverse: None,
        }
    }

    pub fn with_inverse(mut self, inverse: Value) -> Self {
        self.inverse = Some(inverse);
        self
    }
}

/// Result of one pipeline-mediated tool invocation. Errors are values, never
/// panics, so the chat loop can always feed something back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub tool_name: String,
    pub category: ActionCategory,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolInvocation {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
