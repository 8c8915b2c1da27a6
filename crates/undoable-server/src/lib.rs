use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use undoable_core::{
    ActionPipeline, ApprovalGate, CancellationRegistry, ChatLoop, EventBus, InstructionsStore,
    RunConfigStore, RunManager, SessionStore, SettingsService, SkillStore, TurnRequest,
    UndoService,
};
use undoable_providers::ProviderRegistry;
use undoable_scheduler::{PayloadHandler, Scheduler};
use undoable_swarm::{NodeRunStarter, SwarmService};
use undoable_types::{
    NodeRunHandle, OrchestrationOptions, RunInput, RunStatus, Workflow, WorkflowNode,
};

mod http;

pub use http::{app_router, serve};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    pub run_id: String,
    pub session_id: String,
    pub started_at_ms: i64,
}

/// One chat turn per session at a time; a second prompt gets the active run
/// back instead of interleaving with it.
#[derive(Clone, Default)]
pub struct RunRegistry {
    active: Arc<tokio::sync::RwLock<std::collections::HashMap<String, ActiveRun>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str, run_id: String) -> Result<ActiveRun, ActiveRun> {
        let mut guard = self.active.write().await;
        if let Some(existing) = guard.get(session_id).cloned() {
            return Err(existing);
        }
        let run = ActiveRun {
            run_id,
            session_id: session_id.to_string(),
            started_at_ms: undoable_types::now_ms(),
        };
        guard.insert(session_id.to_string(), run.clone());
        Ok(run)
    }

    pub async fn release(&self, session_id: &str, run_id: &str) {
        let mut guard = self.active.write().await;
        if guard
            .get(session_id)
            .map(|run| run.run_id == run_id)
            .unwrap_or(false)
        {
            guard.remove(session_id);
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<ActiveRun> {
        self.active.read().await.get(session_id).cloned()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub runs: RunManager,
    pub sessions: SessionStore,
    pub providers: ProviderRegistry,
    pub pipeline: ActionPipeline,
    pub gate: ApprovalGate,
    pub undo: UndoService,
    pub chat: ChatLoop,
    pub scheduler: Scheduler,
    pub swarm: SwarmService,
    pub settings: SettingsService,
    pub run_config: RunConfigStore,
    pub instructions: InstructionsStore,
    pub skills: SkillStore,
    pub cancellations: CancellationRegistry,
    pub run_registry: RunRegistry,
}

impl AppState {
    /// Starts a run for an instruction and drives a chat turn for it in the
    /// background. The SSE-facing path uses the same turn with a live sink.
    pub fn spawn_instruction_run(
        &self,
        instruction: String,
        agent_id: Option<String>,
        user_id: Option<String>,
        job_id: Option<String>,
    ) -> undoable_types::Run {
        let run = self.runs.create(RunInput {
            user_id: user_id.unwrap_or_else(|| "local".to_string()),
            agent_id: agent_id.clone().unwrap_or_else(|| "default".to_string()),
            instruction: instruction.clone(),
            job_id,
        });
        let state = self.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            let cancel = state.cancellations.create(&run_id).await;
            // Headless run: frames are dropped, envelopes still reach the log.
            let (sink, mut drain) = mpsc::unbounded_channel();
            tokio::spawn(async move { while drain.recv().await.is_some() {} });
            let request = TurnRequest {
                session_id: format!("run-{run_id}"),
                run_id: run_id.clone(),
                message: instruction,
                attachments: Vec::new(),
                agent_id,
            };
            if let Err(err) = state.chat.run_turn(request, sink, cancel).await {
                tracing::warn!(run_id, error = %err, "instruction run failed");
                if let Some(run) = state.runs.get(&run_id) {
                    if !run.status.is_terminal() {
                        let _ = state.runs.update_status(&run_id, RunStatus::Failed, None);
                    }
                }
            }
            state.cancellations.remove(&run_id).await;
        });
        run
    }
}

/// Starts SWARM node work as instruction runs through the chat loop.
pub struct ChatNodeStarter {
    pub state: AppState,
}

#[async_trait]
impl NodeRunStarter for ChatNodeStarter {
    async fn start_node_run(
        &self,
        workflow: &Workflow,
        node: &WorkflowNode,
    ) -> anyhow::Result<NodeRunHandle> {
        let skills = self.state.skills.enabled_refs(&node.skill_refs).await;
        let mut instruction = node
            .prompt
            .clone()
            .unwrap_or_else(|| format!("Execute workflow node `{}`.", node.name));
        if !skills.is_empty() {
            instruction.push_str(&format!("\nEquipped skills: {}.", skills.join(", ")));
        }
        if let Some(extra) = self.state.instructions.active(&workflow.orchestrator_agent_id).await
        {
            instruction.push_str("\n");
            instruction.push_str(&extra);
        }
        let agent_id = node
            .agent_id
            .clone()
            .unwrap_or_else(|| workflow.orchestrator_agent_id.clone());
        let run = self.state.spawn_instruction_run(
            instruction,
            Some(agent_id.clone()),
            Some("swarm".to_string()),
            node.job_id.clone(),
        );
        Ok(NodeRunHandle {
            run_id: run.id,
            job_id: node.job_id.clone(),
            agent_id: Some(agent_id),
        })
    }
}

/// The scheduler does not know what a payload means; this handler does.
/// `swarmNode` payloads re-enter the orchestrator, `instruction` payloads
/// start a plain run.
pub fn make_payload_handler(state: AppState) -> PayloadHandler {
    Arc::new(move |job, _reason| {
        let state = state.clone();
        Box::pin(async move {
            match job.payload.get("kind").and_then(|v| v.as_str()) {
                Some("swarmNode") => {
                    let workflow_id = job
                        .payload
                        .get("workflowId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("payload missing workflowId"))?
                        .to_string();
                    let node_id = job
                        .payload
                        .get("nodeId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("payload missing nodeId"))?
                        .to_string();
                    let options = OrchestrationOptions {
                        node_ids: Some(vec![node_id]),
                        ..Default::default()
                    };
                    let starter = Arc::new(ChatNodeStarter {
                        state: state.clone(),
                    });
                    state.swarm.execute(&workflow_id, options, starter).await?;
                    Ok(())
                }
                Some("instruction") => {
                    let instruction = job
                        .payload
                        .get("instruction")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("payload missing instruction"))?
                        .to_string();
                    let agent_id = job
                        .payload
                        .get("agentId")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string);
                    state.spawn_instruction_run(
                        instruction,
                        agent_id,
                        Some("scheduler".to_string()),
                        Some(job.id.clone()),
                    );
                    Ok(())
                }
                other => anyhow::bail!("unknown job payload kind {other:?}"),
            }
        })
    })
}

pub async fn bind_and_serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    serve(addr, state).await
}
