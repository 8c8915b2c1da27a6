use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use undoable_core::event_bus::Subscription;
use undoable_types::{
    now_ms, EventType, NodeRunHandle, NodeRunStatus, NodeState, Orchestration,
    OrchestrationOptions, OrchestrationStatus, RunStatus, Workflow, WorkflowNode,
    MAX_PARALLEL_CAP,
};
use uuid::Uuid;

use crate::{workspace::prepare_workspace, SwarmService};

/// The collaborator that actually starts a node's work and hands back the
/// run identity to watch.
#[async_trait]
pub trait NodeRunStarter: Send + Sync {
    async fn start_node_run(
        &self,
        workflow: &Workflow,
        node: &WorkflowNode,
    ) -> anyhow::Result<NodeRunHandle>;
}

pub trait OrchestrationOptionsExt {
    fn clamped_max_parallel(&self) -> usize;
}

impl OrchestrationOptionsExt for OrchestrationOptions {
    fn clamped_max_parallel(&self) -> usize {
        self.max_parallel.clamp(1, MAX_PARALLEL_CAP)
    }
}

fn translate_run_status(status: RunStatus) -> NodeRunStatus {
    match status {
        RunStatus::Completed => NodeRunStatus::Completed,
        RunStatus::Cancelled => NodeRunStatus::Cancelled,
        _ => NodeRunStatus::Failed,
    }
}

fn blocked_reason(dependency_name: &str) -> String {
    format!("dependency {dependency_name} did not complete successfully")
}

impl SwarmService {
    /// Builds the run-time graph, seeds node states, and spawns the driver.
    /// Returns the orchestration id immediately.
    pub async fn execute(
        &self,
        workflow_id: &str,
        mut options: OrchestrationOptions,
        starter: Arc<dyn NodeRunStarter>,
    ) -> anyhow::Result<String> {
        let workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown workflow `{workflow_id}`"))?;
        if options.max_parallel == 0 {
            options.max_parallel = self.default_max_parallel;
        }
        options.max_parallel = options.clamped_max_parallel();

        prepare_workspace(std::path::Path::new(&workflow.workspace_dir)).await?;

        let requested = options
            .node_ids
            .clone()
            .unwrap_or_else(|| workflow.nodes.iter().map(|n| n.id.clone()).collect());

        let mut nodes: HashMap<String, NodeState> = HashMap::new();
        let mut pending: HashSet<String> = HashSet::new();
        for id in &requested {
            match workflow.node(id) {
                None => {
                    nodes.insert(id.clone(), NodeState::skipped("node not found"));
                }
                Some(node) if !node.enabled && !options.include_disabled => {
                    nodes.insert(id.clone(), NodeState::skipped("node is disabled"));
                }
                Some(_) => {
                    nodes.insert(id.clone(), NodeState::pending());
                    pending.insert(id.clone());
                }
            }
        }

        // Dependency and reverse maps, restricted to seeded pending nodes.
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &workflow.edges {
            if pending.contains(&edge.from) && pending.contains(&edge.to) {
                dependencies
                    .entry(edge.to.clone())
                    .or_default()
                    .push(edge.from.clone());
                children
                    .entry(edge.from.clone())
                    .or_default()
                    .push(edge.to.clone());
            }
        }

        // Ready queue in workflow-declaration order.
        let ready_queue = workflow
            .nodes
            .iter()
            .filter(|node| pending.contains(&node.id))
            .filter(|node| {
                !options.respect_dependencies
                    || dependencies
                        .get(&node.id)
                        .map(|deps| deps.is_empty())
                        .unwrap_or(true)
            })
            .map(|node| node.id.clone())
            .collect::<Vec<_>>();

        let orchestration = Orchestration {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            status: OrchestrationStatus::Running,
            options,
            nodes,
            dependencies,
            children,
            ready_queue,
            run_to_node: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        let orchestration_id = orchestration.id.clone();
        self.insert_orchestration(orchestration).await;

        let service = self.clone();
        let driver_id = orchestration_id.clone();
        tokio::spawn(async move {
            service.drive(workflow, driver_id, starter).await;
        });
        Ok(orchestration_id)
    }

    async fn insert_orchestration(&self, orchestration: Orchestration) {
        let mut store = self.orchestrations.write().await;
        store.order.push(orchestration.id.clone());
        store
            .records
            .insert(orchestration.id.clone(), orchestration);
        // Trim oldest completed first.
        while store.order.len() > self.max_history {
            let Some(pos) = store.order.iter().position(|id| {
                store
                    .records
                    .get(id)
                    .map(|o| o.status != OrchestrationStatus::Running)
                    .unwrap_or(true)
            }) else {
                break;
            };
            let removed = store.order.remove(pos);
            store.records.remove(&removed);
        }
    }

    async fn drive(
        &self,
        workflow: Workflow,
        orchestration_id: String,
        starter: Arc<dyn NodeRunStarter>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, NodeRunStatus)>();
        let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
        let mut stop_dispatch = false;
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if !stop_dispatch {
                stop_dispatch = self
                    .dispatch_ready(&workflow, &orchestration_id, &starter, &tx, &mut subscriptions)
                    .await;
            }
            if self.try_finish(&orchestration_id).await {
                break;
            }
            tokio::select! {
                completion = rx.recv() => {
                    let Some((run_id, status)) = completion else { break };
                    let node_id = {
                        let store = self.orchestrations.read().await;
                        store
                            .records
                            .get(&orchestration_id)
                            .and_then(|o| o.run_to_node.get(&run_id).cloned())
                    };
                    if let Some(node_id) = node_id {
                        subscriptions.remove(&run_id);
                        stop_dispatch |= self
                            .apply_node_terminal(&workflow, &orchestration_id, &node_id, status, None)
                            .await;
                    }
                }
                _ = ticker.tick() => {}
            }
        }
        // Terminal: detach every remaining event-bus handler.
        subscriptions.clear();
    }

    /// Starts ready nodes up to the parallelism cap. Returns true when
    /// fail-fast tripped while marking a dispatch failure.
    async fn dispatch_ready(
        &self,
        workflow: &Workflow,
        orchestration_id: &str,
        starter: &Arc<dyn NodeRunStarter>,
        tx: &mpsc::UnboundedSender<(String, NodeRunStatus)>,
        subscriptions: &mut HashMap<String, Subscription>,
    ) -> bool {
        let mut tripped = false;
        loop {
            if let Some(gate) = self.gate.read().await.clone() {
                if gate() {
                    return tripped;
                }
            }
            let (node_id, allow_concurrent) = {
                let mut store = self.orchestrations.write().await;
                let Some(orchestration) = store.records.get_mut(orchestration_id) else {
                    return tripped;
                };
                let running = orchestration
                    .nodes
                    .values()
                    .filter(|state| state.status == NodeRunStatus::Running)
                    .count();
                if running >= orchestration.options.max_parallel
                    || orchestration.ready_queue.is_empty()
                {
                    return tripped;
                }
                (
                    orchestration.ready_queue.remove(0),
                    orchestration.options.allow_concurrent,
                )
            };
            let Some(node) = workflow.node(&node_id) else {
                continue;
            };

            if !allow_concurrent {
                if let Some(active_run) = self
                    .active_run_for_node(&workflow.id, &node_id, orchestration_id)
                    .await
                {
                    // Terminal skip; children must still resolve through it.
                    tripped |= self
                        .apply_node_terminal(
                            workflow,
                            orchestration_id,
                            &node_id,
                            NodeRunStatus::Skipped,
                            Some(format!("node has an active run {active_run}")),
                        )
                        .await;
                    continue;
                }
            }

            match starter.start_node_run(workflow, node).await {
                Ok(handle) => {
                    {
                        let mut store = self.orchestrations.write().await;
                        if let Some(orchestration) = store.records.get_mut(orchestration_id) {
                            orchestration
                                .run_to_node
                                .insert(handle.run_id.clone(), node_id.clone());
                            orchestration.nodes.insert(
                                node_id.clone(),
                                NodeState {
                                    status: NodeRunStatus::Running,
                                    run_id: Some(handle.run_id.clone()),
                                    job_id: handle.job_id.clone(),
                                    agent_id: handle.agent_id.clone(),
                                    reason: None,
                                    started_at_ms: Some(now_ms()),
                                    completed_at_ms: None,
                                },
                            );
                        }
                    }
                    let watch_tx = tx.clone();
                    let watch_run = handle.run_id.clone();
                    let subscription =
                        self.runs.bus().on_run(&handle.run_id, move |envelope| {
                            if envelope.event_type != EventType::StatusChanged {
                                return;
                            }
                            let Ok(to) = serde_json::from_value::<RunStatus>(
                                envelope.payload["to"].clone(),
                            ) else {
                                return;
                            };
                            if to.is_terminal() {
                                let _ =
                                    watch_tx.send((watch_run.clone(), translate_run_status(to)));
                            }
                        });
                    subscriptions.insert(handle.run_id.clone(), subscription);
                    // The run may have finished before the watch attached.
                    if let Some(run) = self.runs.get(&handle.run_id) {
                        if run.status.is_terminal() {
                            let _ = tx
                                .send((handle.run_id.clone(), translate_run_status(run.status)));
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(node = %node_id, error = %err, "node dispatch failed");
                    tripped |= self
                        .apply_node_terminal(
                            workflow,
                            orchestration_id,
                            &node_id,
                            NodeRunStatus::Failed,
                            Some(format!("failed to start node run: {err}")),
                        )
                        .await;
                }
            }
        }
    }

    /// Marks a node terminal and resolves its downstream. Returns true when
    /// fail-fast blocked the remainder of the orchestration.
    async fn apply_node_terminal(
        &self,
        workflow: &Workflow,
        orchestration_id: &str,
        node_id: &str,
        status: NodeRunStatus,
        reason: Option<String>,
    ) -> bool {
        let mut store = self.orchestrations.write().await;
        let Some(orchestration) = store.records.get_mut(orchestration_id) else {
            return false;
        };
        if let Some(state) = orchestration.nodes.get_mut(node_id) {
            state.status = status;
            state.reason = reason;
            state.completed_at_ms = Some(now_ms());
        }

        let succeeded = status.succeeded();
        let node_name = workflow
            .node(node_id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| node_id.to_string());

        if orchestration.options.fail_fast && !succeeded {
            let reason = blocked_reason(&node_name);
            for state in orchestration.nodes.values_mut() {
                if state.status == NodeRunStatus::Pending {
                    state.status = NodeRunStatus::Blocked;
                    state.reason = Some(reason.clone());
                    state.completed_at_ms = Some(now_ms());
                }
            }
            orchestration.ready_queue.clear();
            return true;
        }

        let decl_index: HashMap<&str, usize> = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id.as_str(), idx))
            .collect();

        let children = orchestration
            .children
            .get(node_id)
            .cloned()
            .unwrap_or_default();
        for child in children {
            let child_pending = orchestration
                .nodes
                .get(&child)
                .map(|state| state.status == NodeRunStatus::Pending)
                .unwrap_or(false);
            if !child_pending {
                continue;
            }
            let deps = orchestration
                .dependencies
                .get(&child)
                .cloned()
                .unwrap_or_default();
            let statuses = deps
                .iter()
                .filter_map(|dep| orchestration.nodes.get(dep).map(|s| (dep.clone(), s.status)))
                .collect::<Vec<_>>();
            if !statuses.iter().all(|(_, status)| status.is_terminal()) {
                continue;
            }
            if statuses.iter().all(|(_, status)| status.succeeded()) {
                orchestration.ready_queue.push(child.clone());
                orchestration.ready_queue.sort_by_key(|id| {
                    decl_index.get(id.as_str()).copied().unwrap_or(usize::MAX)
                });
            } else {
                let failing = statuses
                    .iter()
                    .find(|(_, status)| !status.succeeded())
                    .map(|(dep, _)| {
                        workflow
                            .node(dep)
                            .map(|n| n.name.clone())
                            .unwrap_or_else(|| dep.clone())
                    })
                    .unwrap_or_else(|| node_name.clone());
                if let Some(state) = orchestration.nodes.get_mut(&child) {
                    state.status = NodeRunStatus::Blocked;
                    state.reason = Some(blocked_reason(&failing));
                    state.completed_at_ms = Some(now_ms());
                }
            }
        }
        false
    }

    /// Terminal when every seeded node is terminal; `completed` only when no
    /// node failed or was cancelled.
    async fn try_finish(&self, orchestration_id: &str) -> bool {
        let mut store = self.orchestrations.write().await;
        let Some(orchestration) = store.records.get_mut(orchestration_id) else {
            return true;
        };
        if orchestration.status != OrchestrationStatus::Running {
            return true;
        }
        let all_terminal = orchestration
            .nodes
            .values()
            .all(|state| state.status.is_terminal());
        if !all_terminal {
            return false;
        }
        let any_bad = orchestration.nodes.values().any(|state| {
            matches!(
                state.status,
                NodeRunStatus::Failed | NodeRunStatus::Cancelled
            )
        });
        orchestration.status = if any_bad {
            OrchestrationStatus::Failed
        } else {
            OrchestrationStatus::Completed
        };
        orchestration.completed_at = Some(Utc::now());
        true
    }

    /// A prior run of the node still in flight, from any stored
    /// orchestration or the node's mirrored job.
    async fn active_run_for_node(
        &self,
        workflow_id: &str,
        node_id: &str,
        current_orchestration: &str,
    ) -> Option<String> {
        let candidates = {
            let store = self.orchestrations.read().await;
            store
                .records
                .values()
                .filter(|o| o.id != current_orchestration && o.workflow_id == workflow_id)
                .flat_map(|o| {
                    o.run_to_node
                        .iter()
                        .filter(|(_, n)| n.as_str() == node_id)
                        .map(|(run_id, _)| run_id.clone())
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        for run_id in candidates {
            if let Some(run) = self.runs.get(&run_id) {
                if !run.status.is_terminal() {
                    return Some(run_id);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeInput, SwarmService};
    use std::sync::Mutex;
    use undoable_core::event_bus::EventBus;
    use undoable_core::runs::RunManager;
    use undoable_scheduler::Scheduler;
    use undoable_types::{NodeType, RunInput, WorkflowEdge};

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

    /// Starts a real run per node and finishes it with the given status.
    struct ScriptedStarter {
        runs: RunManager,
        fail_nodes: Vec<String>,
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeRunStarter for ScriptedStarter {
        async fn start_node_run(
            &self,
            _workflow: &Workflow,
            node: &WorkflowNode,
        ) -> anyhow::Result<NodeRunHandle> {
            self.started.lock().unwrap().push(node.id.clone());
            let run = self.runs.create(RunInput {
                user_id: "swarm".to_string(),
                agent_id: node.agent_id.clone().unwrap_or_else(|| "default".to_string()),
                instruction: node.prompt.clone().unwrap_or_default(),
                job_id: None,
            });
            let runs = self.runs.clone();
            let run_id = run.id.clone();
            let fail = self.fail_nodes.contains(&node.id);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let target = if fail {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                };
                if fail {
                    let _ = runs.update_status(&run_id, target, None);
                } else {
                    let _ = runs.advance_to(&run_id, RunStatus::Completed);
                }
            });
            Ok(NodeRunHandle {
                run_id: run.id,
                job_id: None,
                agent_id: Some("default".to_string()),
            })
        }
    }

    async fn build_chain_workflow(service: &SwarmService, dir: &std::path::Path) -> Workflow {
        let workflow = service
            .create_workflow("wf", "orchestrator", dir.join("ws").display().to_string())
            .await
            .unwrap();
        for id in ["a", "b", "c", "d"] {
            let input = NodeInput {
                id: Some(id.to_string()),
                name: id.to_uppercase(),
                node_type: NodeType::AgentTask,
                ..Default::default()
            };
            service.add_node(&workflow.id, input).await.unwrap();
        }
        // A -> B -> C plus A -> D.
        service
            .set_edges(
                &workflow.id,
                vec![
                    WorkflowEdge { from: "a".into(), to: "b".into(), condition: None },
                    WorkflowEdge { from: "b".into(), to: "c".into(), condition: None },
                    WorkflowEdge { from: "a".into(), to: "d".into(), condition: None },
                ],
            )
            .await
            .unwrap();
        service.get_workflow(&workflow.id).await.unwrap()
    }

    async fn wait_terminal(service: &SwarmService, id: &str) -> Orchestration {
        for _ in 0..300 {
            if let Some(orchestration) = service.get_orchestration(id).await {
                if orchestration.status != OrchestrationStatus::Running {
                    return orchestration;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("orchestration `{id}` never terminated");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chain_completes_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let workflow = build_chain_workflow(&service, dir.path()).await;
        let starter = Arc::new(ScriptedStarter {
            runs: service.runs().clone(),
            fail_nodes: Vec::new(),
            started: Mutex::new(Vec::new()),
        });
        let id = service
            .execute(&workflow.id, OrchestrationOptions::default(), starter.clone())
            .await
            .unwrap();
        let orchestration = wait_terminal(&service, &id).await;
        assert_eq!(orchestration.status, OrchestrationStatus::Completed);
        for node in ["a", "b", "c", "d"] {
            assert_eq!(
                orchestration.nodes[node].status,
                NodeRunStatus::Completed,
                "{node}"
            );
        }
        let started = starter.started.lock().unwrap().clone();
        let pos = |id: &str| started.iter().position(|n| n == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(pos("a") < pos("d"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fail_fast_blocks_everything_downstream_of_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let workflow = build_chain_workflow(&service, dir.path()).await;
        let starter = Arc::new(ScriptedStarter {
            runs: service.runs().clone(),
            fail_nodes: vec!["a".to_string()],
            started: Mutex::new(Vec::new()),
        });
        let id = service
            .execute(&workflow.id, OrchestrationOptions::default(), starter)
            .await
            .unwrap();
        let orchestration = wait_terminal(&service, &id).await;
        assert_eq!(orchestration.status, OrchestrationStatus::Failed);
        assert_eq!(orchestration.nodes["a"].status, NodeRunStatus::Failed);
        for node in ["b", "c", "d"] {
            let state = &orchestration.nodes[node];
            assert_eq!(state.status, NodeRunStatus::Blocked, "{node}");
            assert_eq!(
                state.reason.as_deref(),
                Some("dependency A did not complete successfully"),
                "{node}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn without_fail_fast_only_dependents_block() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        // Diamond: a -> (b, c) -> d, with b failing.
        let workflow = service
            .create_workflow("wf", "orchestrator", dir.path().join("ws").display().to_string())
            .await
            .unwrap();
        for id in ["a", "b", "c", "d"] {
            service
                .add_node(
                    &workflow.id,
                    NodeInput {
                        id: Some(id.to_string()),
                        name: id.to_uppercase(),
                        node_type: NodeType::AgentTask,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        service
            .set_edges(
                &workflow.id,
                vec![
                    WorkflowEdge { from: "a".into(), to: "b".into(), condition: None },
                    WorkflowEdge { from: "a".into(), to: "c".into(), condition: None },
                    WorkflowEdge { from: "b".into(), to: "d".into(), condition: None },
                    WorkflowEdge { from: "c".into(), to: "d".into(), condition: None },
                ],
            )
            .await
            .unwrap();
        let starter = Arc::new(ScriptedStarter {
            runs: service.runs().clone(),
            fail_nodes: vec!["b".to_string()],
            started: Mutex::new(Vec::new()),
        });
        let options = OrchestrationOptions {
            fail_fast: false,
            ..Default::default()
        };
        let id = service.execute(&workflow.id, options, starter).await.unwrap();
        let orchestration = wait_terminal(&service, &id).await;
        assert_eq!(orchestration.status, OrchestrationStatus::Failed);
        // C is b's sibling and still completes; D depends on B and blocks.
        assert_eq!(orchestration.nodes["c"].status, NodeRunStatus::Completed);
        assert_eq!(orchestration.nodes["d"].status, NodeRunStatus::Blocked);
        assert_eq!(
            orchestration.nodes["d"].reason.as_deref(),
            Some("dependency B did not complete successfully")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_and_disabled_nodes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let workflow = service
            .create_workflow("wf", "orchestrator", dir.path().join("ws").display().to_string())
            .await
            .unwrap();
        service
            .add_node(
                &workflow.id,
                NodeInput {
                    id: Some("off".to_string()),
                    name: "Off".to_string(),
                    node_type: NodeType::AgentTask,
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let starter = Arc::new(ScriptedStarter {
            runs: service.runs().clone(),
            fail_nodes: Vec::new(),
            started: Mutex::new(Vec::new()),
        });
        let options = OrchestrationOptions {
            node_ids: Some(vec!["off".to_string(), "ghost".to_string()]),
            ..Default::default()
        };
        let id = service.execute(&workflow.id, options, starter).await.unwrap();
        let orchestration = wait_terminal(&service, &id).await;
        assert_eq!(orchestration.status, OrchestrationStatus::Completed);
        assert_eq!(orchestration.nodes["ghost"].status, NodeRunStatus::Skipped);
        assert_eq!(
            orchestration.nodes["ghost"].reason.as_deref(),
            Some("node not found")
        );
        assert_eq!(orchestration.nodes["off"].status, NodeRunStatus::Skipped);
        assert_eq!(
            orchestration.nodes["off"].reason.as_deref(),
            Some("node is disabled")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workspace_is_seeded_before_first_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let ws = dir.path().join("seeded-ws");
        let workflow = service
            .create_workflow("wf", "orchestrator", ws.display().to_string())
            .await
            .unwrap();
        let starter = Arc::new(ScriptedStarter {
            runs: service.runs().clone(),
            fail_nodes: Vec::new(),
            started: Mutex::new(Vec::new()),
        });
        let id = service
            .execute(&workflow.id, OrchestrationOptions::default(), starter)
            .await
            .unwrap();
        wait_terminal(&service, &id).await;
        assert!(ws.join("ENTRY_POINT.md").exists());
        assert!(ws.join("infra/reconciler.md").exists());
    }
}
