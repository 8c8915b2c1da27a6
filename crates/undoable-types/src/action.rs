use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    Read,
    Mutate,
    Exec,
    Network,
}

impl ActionCategory {
    pub fn is_side_effecting(self) -> bool {
        !matches!(self, ActionCategory::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Auto,
    Granted,
    Denied,
    Skipped,
}

/// One side-effecting tool invocation, recorded for audit and undo.
///
/// Invariant: either `undoable` and `inverse` is present once finalized, or
/// the record can never transition to undone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub tool_name: String,
    pub category: ActionCategory,
    pub args: Value,
    pub undoable: bool,
    pub approval: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub undone: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoStepResult {
    pub action_id: String,
    pub tool_name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UndoStepResult {
    pub fn ok(action_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            tool_name: tool_name.into(),
            ok: true,
            error: None,
        }
    }

    pub fn failed(
        action_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            tool_name: tool_name.into(),
            ok: false,
            error: Some(error.into()),
        }
    }
}
