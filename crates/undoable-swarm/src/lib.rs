use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use undoable_core::persist::{load_versioned, write_json_atomic};
use undoable_core::runs::RunManager;
use undoable_scheduler::Scheduler;
use undoable_types::{
    NodeSchedule, Orchestration, Schedule, ScheduledJob, Workflow, WorkflowEdge, WorkflowNode,
};

pub mod model;
pub mod orchestrator;
pub mod workspace;

pub use model::{detect_cycle, validate_graph, WorkflowError};
pub use orchestrator::{NodeRunStarter, OrchestrationOptionsExt};
pub use workspace::prepare_workspace;

pub const SWARM_STATE_VERSION: u32 = 1;
pub const DEFAULT_ORCHESTRATION_HISTORY: usize = 200;

/// Sync check; `true` blocks node dispatch (daemon paused).
pub type DispatchGate = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwarmFile {
    version: u32,
    workflows: Vec<Workflow>,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: undoable_types::NodeType,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub skill_refs: Vec<String>,
    #[serde(default)]
    pub schedule: Option<NodeSchedule>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub(crate) struct OrchestrationStore {
    pub(crate) records: HashMap<String, Orchestration>,
    pub(crate) order: Vec<String>,
}

/// Owns workflows and orchestrations; obtains run identities from the Run
/// Manager and mirrors node schedules into the Scheduler.
#[derive(Clone)]
pub struct SwarmService {
    path: PathBuf,
    workflows: Arc<RwLock<HashMap<String, Workflow>>>,
    pub(crate) orchestrations: Arc<RwLock<OrchestrationStore>>,
    pub(crate) runs: RunManager,
    scheduler: Scheduler,
    pub(crate) gate: Arc<RwLock<Option<DispatchGate>>>,
    pub(crate) max_history: usize,
    pub(crate) default_max_parallel: usize,
}

impl SwarmService {
    pub async fn load(
        path: PathBuf,
        runs: RunManager,
        scheduler: Scheduler,
    ) -> anyhow::Result<Self> {
        let mut workflows = HashMap::new();
        if let Some(file) = load_versioned::<SwarmFile>(&path, SWARM_STATE_VERSION).await? {
            for workflow in file.workflows {
                workflows.insert(workflow.id.clone(), workflow);
            }
        }
        let max_history = std::env::var("UNDOABLE_SWARM_ORCHESTRATION_HISTORY")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_ORCHESTRATION_HISTORY);
        let default_max_parallel = std::env::var("UNDOABLE_SWARM_MAX_PARALLEL")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(4);
        Ok(Self {
            path,
            workflows: Arc::new(RwLock::new(workflows)),
            orchestrations: Arc::new(RwLock::new(OrchestrationStore {
                records: HashMap::new(),
                order: Vec::new(),
            })),
            runs,
            scheduler,
            gate: Arc::new(RwLock::new(None)),
            max_history,
            default_max_parallel,
        })
    }

    pub async fn set_dispatch_gate(&self, gate: DispatchGate) {
        *self.gate.write().await = Some(gate);
    }

    pub fn runs(&self) -> &RunManager {
        &self.runs
    }

    /// Default parent directory for workflow workspaces, beside the swarm
    /// state file.
    pub fn workspace_root(&self) -> PathBuf {
        self.path
            .parent()
            .map(|parent| parent.join("swarm-workspaces"))
            .unwrap_or_else(|| PathBuf::from("swarm-workspaces"))
    }

    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        orchestrator_agent_id: impl Into<String>,
        workspace_dir: impl Into<String>,
    ) -> anyhow::Result<Workflow> {
        let workflow = Workflow::new(name, orchestrator_agent_id, workspace_dir);
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow.clone());
        self.persist().await?;
        Ok(workflow)
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let mut workflows = self
            .workflows
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        workflows
    }

    pub async fn get_workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(id).cloned()
    }

    pub async fn set_workflow_enabled(&self, id: &str, enabled: bool) -> anyhow::Result<Workflow> {
        let workflow = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown workflow `{id}`"))?;
            workflow.enabled = enabled;
            workflow.updated_at = Utc::now();
            workflow.clone()
        };
        self.persist().await?;
        Ok(workflow)
    }

    pub async fn delete_workflow(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.workflows.write().await.remove(id);
        let Some(workflow) = removed else {
            return Ok(false);
        };
        for node in &workflow.nodes {
            if let Some(job_id) = &node.job_id {
                let _ = self.scheduler.remove_unrecorded(job_id).await;
            }
        }
        self.persist().await?;
        Ok(true)
    }

    /// Node ids are unique within a workflow; a schedule other than
    /// manual/dependency is mirrored into the scheduler and back-pointed via
    /// `jobId`.
    pub async fn add_node(&self, workflow_id: &str, input: NodeInput) -> anyhow::Result<Workflow> {
        let mut node = WorkflowNode {
            id: input
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: input.name,
            node_type: input.node_type,
            prompt: input.prompt,
            agent_id: input.agent_id,
            skill_refs: input.skill_refs,
            schedule: input.schedule.unwrap_or_default(),
            enabled: input.enabled.unwrap_or(true),
            job_id: None,
        };

        // Validate against a candidate graph before committing anything.
        {
            let workflows = self.workflows.read().await;
            let workflow = workflows
                .get(workflow_id)
                .ok_or_else(|| anyhow::anyhow!("unknown workflow `{workflow_id}`"))?;
            let mut candidate = workflow.nodes.clone();
            candidate.push(node.clone());
            validate_graph(&candidate, &workflow.edges)?;
        }

        if let Some(schedule) = mirror_schedule(&node.schedule) {
            let mut job = ScheduledJob::new(
                format!("swarm:{workflow_id}:{}", node.id),
                schedule,
                json!({"kind": "swarmNode", "workflowId": workflow_id, "nodeId": node.id}),
            );
            job.enabled = node.enabled;
            let job = self.scheduler.add_unrecorded(job).await?;
            node.job_id = Some(job.id);
        }

        let workflow = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| anyhow::anyhow!("unknown workflow `{workflow_id}`"))?;
            workflow.nodes.push(node);
            workflow.version += 1;
            workflow.updated_at = Utc::now();
            workflow.clone()
        };
        self.persist().await?;
        Ok(workflow)
    }

    /// Removing a node also drops edges touching it and its mirrored job.
    pub async fn remove_node(&self, workflow_id: &str, node_id: &str) -> anyhow::Result<Workflow> {
        let (workflow, job_id) = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| anyhow::anyhow!("unknown workflow `{workflow_id}`"))?;
            let Some(pos) = workflow.nodes.iter().position(|n| n.id == node_id) else {
                anyhow::bail!("unknown node `{node_id}` in workflow `{workflow_id}`");
            };
            let node = workflow.nodes.remove(pos);
            workflow
                .edges
                .retain(|edge| edge.from != node_id && edge.to != node_id);
            workflow.version += 1;
            workflow.updated_at = Utc::now();
            (workflow.clone(), node.job_id)
        };
        if let Some(job_id) = job_id {
            let _ = self.scheduler.remove_unrecorded(&job_id).await;
        }
        self.persist().await?;
        Ok(workflow)
    }

    /// Replaces the edge set; the result must stay acyclic or the workflow
    /// is left untouched.
    pub async fn set_edges(
        &self,
        workflow_id: &str,
        edges: Vec<WorkflowEdge>,
    ) -> anyhow::Result<Workflow> {
        let workflow = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| anyhow::anyhow!("unknown workflow `{workflow_id}`"))?;
            validate_graph(&workflow.nodes, &edges)?;
            workflow.edges = edges;
            workflow.version += 1;
            workflow.updated_at = Utc::now();
            workflow.clone()
        };
        self.persist().await?;
        Ok(workflow)
    }

    pub async fn get_orchestration(&self, id: &str) -> Option<Orchestration> {
        self.orchestrations.read().await.records.get(id).cloned()
    }

    pub async fn list_orchestrations(&self, workflow_id: Option<&str>) -> Vec<Orchestration> {
        let store = self.orchestrations.read().await;
        store
            .order
            .iter()
            .filter_map(|id| store.records.get(id))
            .filter(|orchestration| {
                workflow_id
                    .map(|wf| orchestration.workflow_id == wf)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = {
            let workflows = self.workflows.read().await;
            let mut list = workflows.values().cloned().collect::<Vec<_>>();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            SwarmFile {
                version: SWARM_STATE_VERSION,
                workflows: list,
                saved_at: Utc::now(),
            }
        };
        write_json_atomic(&self.path, &snapshot).await
    }
}

fn mirror_schedule(schedule: &NodeSchedule) -> Option<Schedule> {
    match schedule {
        NodeSchedule::Manual | NodeSchedule::Dependency => None,
        NodeSchedule::Cron { expr } => Some(Schedule::Cron(expr.clone())),
        NodeSchedule::Every { ms } => Some(Schedule::Every(*ms)),
        NodeSchedule::At { timestamp } => Some(Schedule::At(*timestamp)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use undoable_core::event_bus::EventBus;
    use undoable_types::NodeType;

    async fn service(dir: &std::path::Path) -> SwarmService {
        let bus = EventBus::new();
        let runs = RunManager::load(dir.join("runs-state.json"), bus)
            .await
            .unwrap();
        let scheduler = Scheduler::load(dir.join("jobs-state.json")).await.unwrap();
        SwarmService::load(dir.join("swarm-state.json"), runs, scheduler)
            .await
            .unwrap()
    }

    fn node_input(name: &str) -> NodeInput {
        NodeInput {
            id: Some(name.to_string()),
            name: name.to_string(),
            node_type: NodeType::AgentTask,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn version_strictly_increases_on_structural_change() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let workflow = service
            .create_workflow("wf", "orchestrator", dir.path().join("ws").display().to_string())
            .await
            .unwrap();
        assert_eq!(workflow.version, 1);
        let workflow = service.add_node(&workflow.id, node_input("a")).await.unwrap();
        assert_eq!(workflow.version, 2);
        let workflow = service.add_node(&workflow.id, node_input("b")).await.unwrap();
        assert_eq!(workflow.version, 3);
        let workflow = service
            .set_edges(
                &workflow.id,
                vec![WorkflowEdge {
                    from: "a".to_string(),
                    to: "b".to_string(),
                    condition: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(workflow.version, 4);
    }

    #[tokio::test]
    async fn cyclic_edge_set_is_rejected_and_workflow_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let workflow = service
            .create_workflow("wf", "orchestrator", dir.path().join("ws").display().to_string())
            .await
            .unwrap();
        let workflow = service.add_node(&workflow.id, node_input("a")).await.unwrap();
        let workflow = service.add_node(&workflow.id, node_input("b")).await.unwrap();
        let edges = vec![
            WorkflowEdge {
                from: "a".to_string(),
                to: "b".to_string(),
                condition: None,
            },
            WorkflowEdge {
                from: "b".to_string(),
                to: "a".to_string(),
                condition: None,
            },
        ];
        let before = workflow.version;
        assert!(service.set_edges(&workflow.id, edges).await.is_err());
        let after = service.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(after.version, before);
        assert!(after.edges.is_empty());
    }

    #[tokio::test]
    async fn duplicate_node_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let workflow = service
            .create_workflow("wf", "orchestrator", dir.path().join("ws").display().to_string())
            .await
            .unwrap();
        service.add_node(&workflow.id, node_input("a")).await.unwrap();
        assert!(service.add_node(&workflow.id, node_input("a")).await.is_err());
    }

    #[tokio::test]
    async fn scheduled_node_mirrors_into_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let workflow = service
            .create_workflow("wf", "orchestrator", dir.path().join("ws").display().to_string())
            .await
            .unwrap();
        let mut input = node_input("cron-node");
        input.schedule = Some(NodeSchedule::Cron {
            expr: "*/5 * * * *".to_string(),
        });
        let workflow = service.add_node(&workflow.id, input).await.unwrap();
        let node = workflow.node("cron-node").unwrap();
        let job_id = node.job_id.clone().expect("mirrored job id");

        let job = service.scheduler.get(&job_id).await.unwrap();
        assert_eq!(job.payload["kind"], "swarmNode");
        assert_eq!(job.payload["nodeId"], "cron-node");

        // Removing the node drops the mirrored job.
        service.remove_node(&workflow.id, "cron-node").await.unwrap();
        assert!(service.scheduler.get(&job_id).await.is_none());
    }
}
