use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Planning,
    Planned,
    Shadowing,
    Shadowed,
    ApprovalRequired,
    Applying,
    Completed,
    Failed,
    Cancelled,
    Undoing,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Forward edges of the run lifecycle. Any non-terminal status may also
    /// move to `Failed` or `Cancelled`.
    pub fn can_transition(self, next: RunStatus) -> bool {
        if self == next {
            return false;
        }
        if !self.is_terminal() && matches!(next, RunStatus::Failed | RunStatus::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (RunStatus::Created, RunStatus::Planning)
                | (RunStatus::Planning, RunStatus::Planned)
                | (RunStatus::Planned, RunStatus::Shadowing)
                | (RunStatus::Shadowing, RunStatus::Shadowed)
                | (RunStatus::Shadowed, RunStatus::ApprovalRequired)
                | (RunStatus::ApprovalRequired, RunStatus::Applying)
                | (RunStatus::Applying, RunStatus::Completed)
                | (RunStatus::Applying, RunStatus::Undoing)
                | (RunStatus::Completed, RunStatus::Undoing)
                | (RunStatus::Undoing, RunStatus::Completed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RunStatus::Created => "created",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::Shadowing => "shadowing",
            RunStatus::Shadowed => "shadowed",
            RunStatus::ApprovalRequired => "approval_required",
            RunStatus::Applying => "applying",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Undoing => "undoing",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(default)]
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub user_id: String,
    pub agent_id: String,
    pub instruction: String,
    pub job_id: Option<String>,
}

impl Run {
    pub fn new(input: RunInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id,
            agent_id: input.agent_id,
            instruction: input.instruction,
            job_id: input.job_id,
            status: RunStatus::Created,
            plan: None,
            paused: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    StatusChanged,
    ToolCall,
    ToolResult,
    LlmToken,
    ApprovalRequested,
    ApprovalResolved,
    RunCompleted,
    RunFailed,
    Warning,
}

/// The only cross-component communication primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: u64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_chain_is_accepted() {
        let chain = [
            RunStatus::Created,
            RunStatus::Planning,
            RunStatus::Planned,
            RunStatus::Shadowing,
            RunStatus::Shadowed,
            RunStatus::ApprovalRequired,
            RunStatus::Applying,
            RunStatus::Completed,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?}->{:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn any_non_terminal_can_fail_or_cancel() {
        for status in [
            RunStatus::Created,
            RunStatus::Planning,
            RunStatus::Planned,
            RunStatus::Shadowing,
            RunStatus::Shadowed,
            RunStatus::ApprovalRequired,
            RunStatus::Applying,
            RunStatus::Undoing,
        ] {
            assert!(status.can_transition(RunStatus::Failed));
            assert!(status.can_transition(RunStatus::Cancelled));
        }
    }

    #[test]
    fn terminal_statuses_do_not_move_sideways() {
        assert!(!RunStatus::Failed.can_transition(RunStatus::Planning));
        assert!(!RunStatus::Cancelled.can_transition(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition(RunStatus::Planning));
        // Post-hoc undo of a completed run is the one allowed exit.
        assert!(RunStatus::Completed.can_transition(RunStatus::Undoing));
    }

    #[test]
    fn event_type_uses_screaming_snake_wire_names() {
        let encoded = serde_json::to_string(&EventType::ApprovalRequested).unwrap();
        assert_eq!(encoded, "\"APPROVAL_REQUESTED\"");
    }
}
