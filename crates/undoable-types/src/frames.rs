use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One SSE frame of a chat turn. Serialized as `{"type": "...", ...}`;
/// clients ignore unknown types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    SessionInfo {
        #[serde(rename = "sessionId")]
        session_id: String,
        model: String,
        mode: String,
        economy: bool,
    },
    Progress {
        iteration: u32,
        #[serde(rename = "maxIterations")]
        max_iterations: u32,
    },
    Token {
        delta: String,
    },
    Thinking {
        delta: String,
    },
    ToolCall {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ApprovalRequest {
        id: String,
        tool: String,
        args: Value,
        description: String,
    },
    ApprovalResolved {
        id: String,
        approved: bool,
    },
    Alignment {
        score: f64,
        threshold: f64,
    },
    Warning {
        code: String,
        message: String,
    },
    Done {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
}
