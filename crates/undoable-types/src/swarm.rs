use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Trigger,
    Router,
    ApprovalGate,
    IntegrationTask,
    SkillBuilder,
    AgentTask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeSchedule {
    Manual,
    Dependency,
    Cron { expr: String },
    Every { ms: u64 },
    At { timestamp: i64 },
}

impl Default for NodeSchedule {
    fn default() -> Self {
        NodeSchedule::Dependency
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub skill_refs: Vec<String>,
    #[serde(default)]
    pub schedule: NodeSchedule,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Set when the node's schedule is mirrored into the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub orchestrator_agent_id: String,
    pub workspace_dir: String,
    pub enabled: bool,
    /// Strictly increases on any structural change.
    pub version: u64,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        orchestrator_agent_id: impl Into<String>,
        workspace_dir: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            orchestrator_agent_id: orchestrator_agent_id.into(),
            workspace_dir: workspace_dir.into(),
            enabled: true,
            version: 1,
            nodes: Vec::new(),
            edges: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
    Blocked,
}

impl NodeRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeRunStatus::Pending | NodeRunStatus::Running)
    }

    pub fn succeeded(self) -> bool {
        matches!(self, NodeRunStatus::Completed | NodeRunStatus::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
}

impl NodeState {
    pub fn pending() -> Self {
        Self {
            status: NodeRunStatus::Pending,
            run_id: None,
            job_id: None,
            agent_id: None,
            reason: None,
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: NodeRunStatus::Skipped,
            reason: Some(reason.into()),
            ..Self::pending()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<String>>,
    #[serde(default)]
    pub include_disabled: bool,
    #[serde(default)]
    pub allow_concurrent: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default = "default_true")]
    pub respect_dependencies: bool,
}

fn default_max_parallel() -> usize {
    4
}

pub const MAX_PARALLEL_CAP: usize = 64;

impl Default for OrchestrationOptions {
    fn default() -> Self {
        Self {
            node_ids: None,
            include_disabled: false,
            allow_concurrent: false,
            max_parallel: default_max_parallel(),
            fail_fast: true,
            respect_dependencies: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orchestration {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: u64,
    pub status: OrchestrationStatus,
    pub options: OrchestrationOptions,
    pub nodes: HashMap<String, NodeState>,
    /// nodeId -> ids of the nodes it depends on.
    pub dependencies: HashMap<String, Vec<String>>,
    /// nodeId -> ids of the nodes that depend on it.
    pub children: HashMap<String, Vec<String>>,
    pub ready_queue: Vec<String>,
    pub run_to_node: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Identities handed back by the collaborator that actually starts a node's
/// work (a Run, plus the optional scheduler/job identities behind it).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunHandle {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}
