use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use undoable_tools::ToolRegistry;
use undoable_types::{
    ActionCategory, ApprovalState, EventType, SecurityPolicy, ToolInvocation,
};

use crate::action_log::ActionLog;
use crate::approvals::{ApprovalDecision, ApprovalGate, ApprovalSource};
use crate::event_bus::EventBus;

pub const UNDO_GUARANTEE_BLOCKED: &str = "undo_guarantee_blocked";

/// Guards the undo-guarantee: a mutate/exec tool without a declared inverse
/// is refused before execution unless policy admits it or the user released
/// the guard for one call.
#[derive(Clone)]
pub struct UndoGuard {
    allow_irreversible: bool,
    warn_on_irreversible: bool,
    allow_once: Arc<RwLock<HashSet<String>>>,
}

impl UndoGuard {
    pub fn from_policy(policy: SecurityPolicy, env_override: bool) -> Self {
        let (allow, warn) = if env_override {
            (true, false)
        } else {
            match policy {
                SecurityPolicy::Strict => (false, false),
                SecurityPolicy::Balanced => (true, true),
                SecurityPolicy::Permissive => (true, false),
            }
        };
        Self {
            allow_irreversible: allow,
            warn_on_irreversible: warn,
            allow_once: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Release the guard for a single upcoming call of `tool`.
    pub async fn allow_once(&self, tool: &str) {
        self.allow_once.write().await.insert(tool.to_string());
    }

    async fn consume_allow_once(&self, tool: &str) -> bool {
        self.allow_once.write().await.remove(tool)
    }
}

#[derive(Clone)]
pub struct ActionPipeline {
    tools: ToolRegistry,
    log: ActionLog,
    gate: ApprovalGate,
    bus: EventBus,
    guard: UndoGuard,
}

impl ActionPipeline {
    pub fn new(
        tools: ToolRegistry,
        log: ActionLog,
        gate: ApprovalGate,
        bus: EventBus,
        guard: UndoGuard,
    ) -> Self {
        Self {
            tools,
            log,
            gate,
            bus,
            guard,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn guard(&self) -> &UndoGuard {
        &self.guard
    }

    /// The middleware chain: approval gate, pre-action record, execution,
    /// finalization. Failures come back as `{error}` values, never panics.
    pub async fn invoke(
        &self,
        run_id: Option<&str>,
        tool_name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolInvocation {
        let Some(tool) = self.tools.get(tool_name).await else {
            return ToolInvocation {
                action_id: None,
                tool_name: tool_name.to_string(),
                category: ActionCategory::Read,
                output: String::new(),
                error: Some(format!("unknown tool `{tool_name}`")),
                duration_ms: 0,
            };
        };
        let category = tool.category();
        let undoable = tool.undoable();

        if category.is_side_effecting() && !undoable && !matches!(category, ActionCategory::Network)
        {
            let released = self.guard.consume_allow_once(tool_name).await;
            if !released && !self.guard.allow_irreversible {
                if let Some(run_id) = run_id {
                    self.bus.emit(
                        run_id,
                        EventType::Warning,
                        json!({
                            "code": UNDO_GUARANTEE_BLOCKED,
                            "tool": tool_name,
                            "hint": "re-issue with allow-once or relax the security policy",
                        }),
                        None,
                    );
                }
                return ToolInvocation {
                    action_id: None,
                    tool_name: tool_name.to_string(),
                    category,
                    output: String::new(),
                    error: Some(format!(
                        "tool `{tool_name}` is irreversible and blocked by the undo guarantee"
                    )),
                    duration_ms: 0,
                };
            }
            if !released && self.guard.warn_on_irreversible {
                if let Some(run_id) = run_id {
                    self.bus.emit(
                        run_id,
                        EventType::Warning,
                        json!({
                            "code": "irreversible_action",
                            "tool": tool_name,
                        }),
                        None,
                    );
                }
            }
        }

        let description = format!("{tool_name} ({category:?})").to_lowercase();
        let decision = self
            .gate
            .request_approval(run_id, tool_name, category, &args, &description, cancel.clone())
            .await;
        let approval_state = match &decision {
            ApprovalDecision::Granted {
                source: ApprovalSource::Auto,
            } => ApprovalState::Auto,
            ApprovalDecision::Granted { .. } => ApprovalState::Granted,
            ApprovalDecision::Denied { .. } => ApprovalState::Denied,
        };
        if let ApprovalDecision::Denied { reason } = decision {
            return ToolInvocation {
                action_id: None,
                tool_name: tool_name.to_string(),
                category,
                output: String::new(),
                error: Some(format!("approval denied for `{tool_name}`: {reason}")),
                duration_ms: 0,
            };
        }

        let action_id = self
            .log
            .begin(
                run_id.map(ToString::to_string),
                tool_name,
                category,
                args.clone(),
                undoable,
                approval_state,
            )
            .await;
        if let Some(run_id) = run_id {
            self.bus.emit(
                run_id,
                EventType::ToolCall,
                json!({
                    "actionId": action_id,
                    "tool": tool_name,
                    "category": category,
                    "args": args,
                }),
                None,
            );
        }

        // The run token gates the approval wait only: once granted, an
        // in-flight call runs to completion so its inverse is still captured.
        let started = Instant::now();
        let result = tool.execute(args, CancellationToken::new()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let invocation = match result {
            Ok(outcome) => {
                let inverse = if undoable { outcome.inverse } else { None };
                self.log
                    .finalize(&action_id, duration_ms, None, inverse)
                    .await;
                ToolInvocation {
                    action_id: Some(action_id.clone()),
                    tool_name: tool_name.to_string(),
                    category,
                    output: outcome.output,
                    error: None,
                    duration_ms,
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.log
                    .finalize(&action_id, duration_ms, Some(message.clone()), None)
                    .await;
                ToolInvocation {
                    action_id: Some(action_id.clone()),
                    tool_name: tool_name.to_string(),
                    category,
                    output: String::new(),
                    error: Some(message),
                    duration_ms,
                }
            }
        };

        if let Some(run_id) = run_id {
            self.bus.emit(
                run_id,
                EventType::ToolResult,
                json!({
                    "actionId": action_id,
                    "tool": tool_name,
                    "error": invocation.error,
                    "durationMs": invocation.duration_ms,
                }),
                None,
            );
        }
        invocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use undoable_types::ApprovalMode;

    fn pipeline(policy: SecurityPolicy, mode: ApprovalMode) -> ActionPipeline {
        let bus = EventBus::new();
        ActionPipeline::new(
            ToolRegistry::with_builtins(),
            ActionLog::new(),
            ApprovalGate::new(bus.clone(), mode),
            bus,
            UndoGuard::from_policy(policy, false),
        )
    }

    #[tokio::test]
    async fn granted_write_records_an_undoable_action() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s2.txt");
        let pipe = pipeline(SecurityPolicy::Balanced, ApprovalMode::Off);
        let invocation = pipe
            .invoke(
                None,
                "write_file",
                json!({"path": path.display().to_string(), "content": "hi"}),
                CancellationToken::new(),
            )
            .await;
        assert!(invocation.error.is_none());
        let entries = pipe.log().list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, ActionCategory::Mutate);
        assert!(entries[0].undoable);
        assert!(entries[0].inverse.is_some());
    }

    #[tokio::test]
    async fn strict_policy_blocks_irreversible_exec_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran.txt");
        let pipe = pipeline(SecurityPolicy::Strict, ApprovalMode::Off);
        let invocation = pipe
            .invoke(
                None,
                "bash",
                json!({"command": format!("touch {}", marker.display())}),
                CancellationToken::new(),
            )
            .await;
        assert!(invocation
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("undo guarantee"));
        assert!(!marker.exists(), "blocked call must not run");
        assert!(pipe.log().is_empty().await);
    }

    #[tokio::test]
    async fn allow_once_releases_the_guard_for_a_single_call() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("once.txt");
        let pipe = pipeline(SecurityPolicy::Strict, ApprovalMode::Off);
        pipe.guard().allow_once("bash").await;
        let first = pipe
            .invoke(
                None,
                "bash",
                json!({"command": format!("touch {}", marker.display())}),
                CancellationToken::new(),
            )
            .await;
        assert!(first.error.is_none(), "{:?}", first.error);
        assert!(marker.exists());

        let second = pipe
            .invoke(
                None,
                "bash",
                json!({"command": "true"}),
                CancellationToken::new(),
            )
            .await;
        assert!(second.error.is_some(), "guard applies again after one call");
    }

    #[tokio::test]
    async fn tool_failure_is_a_value_not_a_panic() {
        let pipe = pipeline(SecurityPolicy::Balanced, ApprovalMode::Off);
        let invocation = pipe
            .invoke(
                None,
                "read_file",
                json!({"path": "/definitely/not/here.txt"}),
                CancellationToken::new(),
            )
            .await;
        assert!(invocation.error.is_some());
        let record = pipe.log().list().await.pop().unwrap();
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn unknown_tool_returns_structured_error() {
        let pipe = pipeline(SecurityPolicy::Balanced, ApprovalMode::Off);
        let invocation = pipe
            .invoke(None, "nope", json!({}), CancellationToken::new())
            .await;
        assert!(invocation.error.unwrap().contains("unknown tool"));
    }
}
