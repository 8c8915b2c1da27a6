use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undoable_types::{ActionCategory, ApprovalMode, EventType};

use crate::event_bus::EventBus;

pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSource {
    Auto,
    User,
    AllowAlways,
}

#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Granted { source: ApprovalSource },
    Denied { reason: String },
}

impl ApprovalDecision {
    pub fn approved(&self) -> bool {
        matches!(self, ApprovalDecision::Granted { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub tool: String,
    pub category: ActionCategory,
    pub args: Value,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

struct GateInner {
    pending: HashMap<String, PendingApproval>,
    waiters: HashMap<String, watch::Sender<Option<(bool, bool)>>>,
    /// (tool, arg-shape) pairs granted with allow-always.
    allowlist: HashSet<(String, String)>,
}

/// Interactive allow/allow-always/reject broker for mutating tools. Pending
/// requests live only in memory; a restart rejects everything outstanding.
#[derive(Clone)]
pub struct ApprovalGate {
    inner: Arc<RwLock<GateInner>>,
    mode: Arc<RwLock<ApprovalMode>>,
    bus: EventBus,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(bus: EventBus, mode: ApprovalMode) -> Self {
        Self::with_timeout(bus, mode, APPROVAL_TIMEOUT)
    }

    pub fn with_timeout(bus: EventBus, mode: ApprovalMode, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(GateInner {
                pending: HashMap::new(),
                waiters: HashMap::new(),
                allowlist: HashSet::new(),
            })),
            mode: Arc::new(RwLock::new(mode)),
            bus,
            timeout,
        }
    }

    pub async fn mode(&self) -> ApprovalMode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: ApprovalMode) {
        *self.mode.write().await = mode;
    }

    pub async fn pending(&self) -> Vec<PendingApproval> {
        let mut list = self
            .inner
            .read()
            .await
            .pending
            .values()
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Registers the request when the mode requires interaction and suspends
    /// until resolved, cancelled, or timed out (auto-reject).
    pub async fn request_approval(
        &self,
        run_id: Option<&str>,
        tool: &str,
        category: ActionCategory,
        args: &Value,
        description: &str,
        cancel: CancellationToken,
    ) -> ApprovalDecision {
        let mode = *self.mode.read().await;
        match mode {
            ApprovalMode::Off => {
                return ApprovalDecision::Granted {
                    source: ApprovalSource::Auto,
                }
            }
            ApprovalMode::Mutate if matches!(category, ActionCategory::Read) => {
                return ApprovalDecision::Granted {
                    source: ApprovalSource::Auto,
                }
            }
            _ => {}
        }

        let shape = arg_shape(args);
        if self
            .inner
            .read()
            .await
            .allowlist
            .contains(&(tool.to_string(), shape.clone()))
        {
            return ApprovalDecision::Granted {
                source: ApprovalSource::AllowAlways,
            };
        }

        let request = PendingApproval {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.map(ToString::to_string),
            tool: tool.to_string(),
            category,
            args: args.clone(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        let id = request.id.clone();
        let (tx, mut rx) = watch::channel(None);
        {
            let mut inner = self.inner.write().await;
            inner.pending.insert(id.clone(), request.clone());
            inner.waiters.insert(id.clone(), tx);
        }
        if let Some(run_id) = run_id {
            self.bus.emit(
                run_id,
                EventType::ApprovalRequested,
                json!({
                    "approvalId": id,
                    "tool": tool,
                    "category": category,
                    "args": args,
                    "description": description,
                }),
                None,
            );
        }

        let resolution: Option<(bool, bool)> = tokio::select! {
            _ = tokio::time::sleep(self.timeout) => None,
            _ = cancel.cancelled() => None,
            changed = rx.changed() => {
                if changed.is_ok() {
                    *rx.borrow()
                } else {
                    None
                }
            }
        };

        {
            let mut inner = self.inner.write().await;
            inner.pending.remove(&id);
            inner.waiters.remove(&id);
        }

        let decision = match resolution {
            Some((true, allow_always)) => {
                if allow_always {
                    self.inner
                        .write()
                        .await
                        .allowlist
                        .insert((tool.to_string(), shape));
                    ApprovalDecision::Granted {
                        source: ApprovalSource::AllowAlways,
                    }
                } else {
                    ApprovalDecision::Granted {
                        source: ApprovalSource::User,
                    }
                }
            }
            Some((false, _)) => ApprovalDecision::Denied {
                reason: "approval rejected by user".to_string(),
            },
            None if cancel.is_cancelled() => ApprovalDecision::Denied {
                reason: "run cancelled while awaiting approval".to_string(),
            },
            None => ApprovalDecision::Denied {
                reason: "approval timed out".to_string(),
            },
        };

        if let Some(run_id) = run_id {
            self.bus.emit(
                run_id,
                EventType::ApprovalResolved,
                json!({
                    "approvalId": id,
                    "approved": decision.approved(),
                }),
                None,
            );
        }
        decision
    }

    pub async fn resolve(&self, id: &str, approved: bool, allow_always: bool) -> bool {
        let inner = self.inner.read().await;
        let Some(waiter) = inner.waiters.get(id) else {
            return false;
        };
        waiter.send(Some((approved, allow_always))).is_ok()
    }

    /// Rejects everything outstanding; used on shutdown and run cancellation.
    pub async fn reject_all(&self) {
        let waiters = {
            let inner = self.inner.read().await;
            inner.waiters.values().cloned().collect::<Vec<_>>()
        };
        for waiter in waiters {
            let _ = waiter.send(Some((false, false)));
        }
    }
}

/// Allow-always matches on call shape, not values: the tool name plus the
/// sorted argument keys.
pub fn arg_shape(args: &Value) -> String {
    match args {
        Value::Object(map) => {
            let mut keys = map.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            keys.join(",")
        }
        Value::Null => "null".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn off_mode_grants_immediately() {
        let gate = ApprovalGate::new(EventBus::new(), ApprovalMode::Off);
        let decision = gate
            .request_approval(
                None,
                "bash",
                ActionCategory::Exec,
                &json!({"command": "ls"}),
                "run ls",
                CancellationToken::new(),
            )
            .await;
        assert!(decision.approved());
    }

    #[tokio::test]
    async fn mutate_mode_auto_grants_reads_only() {
        let gate =
            ApprovalGate::with_timeout(EventBus::new(), ApprovalMode::Mutate, Duration::from_millis(50));
        let read = gate
            .request_approval(
                None,
                "read_file",
                ActionCategory::Read,
                &json!({"path": "x"}),
                "read",
                CancellationToken::new(),
            )
            .await;
        assert!(read.approved());

        // A mutate call with nobody resolving times out into a rejection.
        let write = gate
            .request_approval(
                None,
                "write_file",
                ActionCategory::Mutate,
                &json!({"path": "x", "content": "y"}),
                "write",
                CancellationToken::new(),
            )
            .await;
        assert!(!write.approved());
    }

    #[tokio::test]
    async fn resolve_unblocks_waiter() {
        let gate = ApprovalGate::new(EventBus::new(), ApprovalMode::Always);
        let gate_clone = gate.clone();
        let resolver = tokio::spawn(async move {
            loop {
                let pending = gate_clone.pending().await;
                if let Some(first) = pending.first() {
                    gate_clone.resolve(&first.id, true, false).await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let decision = gate
            .request_approval(
                None,
                "bash",
                ActionCategory::Exec,
                &json!({"command": "true"}),
                "exec",
                CancellationToken::new(),
            )
            .await;
        resolver.await.unwrap();
        assert!(decision.approved());
        assert!(gate.pending().await.is_empty());
    }

    #[tokio::test]
    async fn allow_always_skips_the_next_identical_shape() {
        let gate = ApprovalGate::new(EventBus::new(), ApprovalMode::Always);
        let gate_clone = gate.clone();
        tokio::spawn(async move {
            loop {
                let pending = gate_clone.pending().await;
                if let Some(first) = pending.first() {
                    gate_clone.resolve(&first.id, true, true).await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let args = json!({"command": "echo hi"});
        let first = gate
            .request_approval(
                None,
                "bash",
                ActionCategory::Exec,
                &args,
                "exec",
                CancellationToken::new(),
            )
            .await;
        assert!(first.approved());

        // Same shape, different value: no new pending request appears.
        let second = gate
            .request_approval(
                None,
                "bash",
                ActionCategory::Exec,
                &json!({"command": "echo bye"}),
                "exec",
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            second,
            ApprovalDecision::Granted {
                source: ApprovalSource::AllowAlways
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_rejects_the_wait() {
        let gate = ApprovalGate::new(EventBus::new(), ApprovalMode::Always);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });
        let decision = gate
            .request_approval(
                None,
                "bash",
                ActionCategory::Exec,
                &json!({"command": "sleep 5"}),
                "exec",
                cancel,
            )
            .await;
        assert!(!decision.approved());
    }
}
