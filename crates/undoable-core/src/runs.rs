use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use undoable_types::{EventEnvelope, EventType, Run, RunInput, RunStatus};

use crate::event_bus::{EventBus, Subscription};
use crate::persist::{load_versioned, spawn_debounced_flusher, write_json_atomic, FlushHandle};

pub const RUNS_STATE_VERSION: u32 = 1;
pub const EVENT_LOG_CAP: usize = 4_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunEventLog {
    run_id: String,
    events: Vec<EventEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunsStateFile {
    version: u32,
    runs: Vec<Run>,
    event_logs: Vec<RunEventLog>,
    saved_at: DateTime<Utc>,
}

#[derive(Default)]
struct RunsState {
    runs: HashMap<String, Run>,
    logs: HashMap<String, VecDeque<EventEnvelope>>,
}

impl RunsState {
    fn snapshot(&self) -> RunsStateFile {
        let mut runs = self.runs.values().cloned().collect::<Vec<_>>();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut event_logs = self
            .logs
            .iter()
            .map(|(run_id, events)| RunEventLog {
                run_id: run_id.clone(),
                events: events.iter().cloned().collect(),
            })
            .collect::<Vec<_>>();
        event_logs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        RunsStateFile {
            version: RUNS_STATE_VERSION,
            runs,
            event_logs,
            saved_at: Utc::now(),
        }
    }
}

/// Authoritative owner of run records and their event logs.
#[derive(Clone)]
pub struct RunManager {
    state: Arc<RwLock<RunsState>>,
    bus: EventBus,
    flush: Arc<FlushHandle>,
    _log_feed: Arc<Subscription>,
}

impl RunManager {
    /// Loads persisted runs and applies the crash-recovery rule: any run
    /// left non-terminal is rewritten to `failed` with a fresh `updatedAt`.
    pub async fn load(path: PathBuf, bus: EventBus) -> anyhow::Result<Self> {
        let mut state = RunsState::default();
        if let Some(file) =
            load_versioned::<RunsStateFile>(&path, RUNS_STATE_VERSION).await?
        {
            for mut run in file.runs {
                if !run.status.is_terminal() {
                    run.status = RunStatus::Failed;
                    run.updated_at = Utc::now();
                }
                state.runs.insert(run.id.clone(), run);
            }
            for log in file.event_logs {
                state
                    .logs
                    .insert(log.run_id.clone(), log.events.into_iter().collect());
            }
        }

        let state = Arc::new(RwLock::new(state));
        let flush_state = state.clone();
        let flush_path = path.clone();
        let flush = spawn_debounced_flusher(move || {
            let snapshot = match flush_state.read() {
                Ok(state) => state.snapshot(),
                Err(poisoned) => poisoned.into_inner().snapshot(),
            };
            let path = flush_path.clone();
            async move { write_json_atomic(&path, &snapshot).await }
        });

        // Every envelope emitted for a known run lands in its bounded log.
        let feed_state = state.clone();
        let feed_flush = flush.clone();
        let subscription = bus.on_all(move |envelope| {
            let mut state = match feed_state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !state.runs.contains_key(&envelope.run_id) {
                return;
            }
            let log = state.logs.entry(envelope.run_id.clone()).or_default();
            log.push_back(envelope.clone());
            while log.len() > EVENT_LOG_CAP {
                log.pop_front();
            }
            feed_flush.schedule();
        });

        Ok(Self {
            state,
            bus,
            flush,
            _log_feed: Arc::new(subscription),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn create(&self, input: RunInput) -> Run {
        let run = Run::new(input);
        {
            let mut state = self.write_state();
            state.runs.insert(run.id.clone(), run.clone());
            state.logs.insert(run.id.clone(), VecDeque::new());
        }
        self.bus.emit(
            &run.id,
            EventType::RunCreated,
            json!({
                "userId": run.user_id,
                "agentId": run.agent_id,
                "instruction": run.instruction,
                "jobId": run.job_id,
            }),
            None,
        );
        self.flush.flush_now();
        run
    }

    pub fn get(&self, id: &str) -> Option<Run> {
        self.read_state().runs.get(id).cloned()
    }

    pub fn list(&self, user_id: Option<&str>) -> Vec<Run> {
        let mut runs = self
            .read_state()
            .runs
            .values()
            .filter(|run| user_id.map(|u| run.user_id == u).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn list_by_job_id(&self, job_id: &str) -> Vec<Run> {
        let mut runs = self
            .read_state()
            .runs
            .values()
            .filter(|run| run.job_id.as_deref() == Some(job_id))
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Any run that has not reached a terminal status.
    pub fn active(&self) -> Vec<Run> {
        self.read_state()
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn update_status(
        &self,
        id: &str,
        next: RunStatus,
        actor: Option<String>,
    ) -> anyhow::Result<Run> {
        let (run, previous) = {
            let mut state = self.write_state();
            let run = state
                .runs
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown run `{id}`"))?;
            let previous = run.status;
            if !previous.can_transition(next) {
                anyhow::bail!("invalid run transition {previous} -> {next}");
            }
            run.status = next;
            run.updated_at = Utc::now();
            (run.clone(), previous)
        };
        self.bus.emit(
            id,
            EventType::StatusChanged,
            json!({"from": previous, "to": next}),
            actor.clone(),
        );
        match next {
            RunStatus::Completed => {
                self.bus
                    .emit(id, EventType::RunCompleted, json!({}), actor);
            }
            RunStatus::Failed => {
                self.bus.emit(id, EventType::RunFailed, json!({}), actor);
            }
            _ => {}
        }
        // Status changes always force an immediate flush.
        self.flush.flush_now();
        Ok(run)
    }

    /// Walks the canonical forward chain up to `target`, emitting one
    /// STATUS_CHANGED per hop. A target at or behind the current status is a
    /// no-op.
    pub fn advance_to(&self, id: &str, target: RunStatus) -> anyhow::Result<Run> {
        const CHAIN: [RunStatus; 8] = [
            RunStatus::Created,
            RunStatus::Planning,
            RunStatus::Planned,
            RunStatus::Shadowing,
            RunStatus::Shadowed,
            RunStatus::ApprovalRequired,
            RunStatus::Applying,
            RunStatus::Completed,
        ];
        let current = self
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown run `{id}`"))?
            .status;
        let Some(current_rank) = CHAIN.iter().position(|s| *s == current) else {
            anyhow::bail!("run `{id}` is not on the forward chain ({current})");
        };
        let Some(target_rank) = CHAIN.iter().position(|s| *s == target) else {
            anyhow::bail!("{target} is not on the forward chain");
        };
        let mut run = self
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown run `{id}`"))?;
        for step in (current_rank + 1)..=target_rank {
            run = self.update_status(id, CHAIN[step], None)?;
        }
        Ok(run)
    }

    /// Attaches the immutable plan graph. A second call is rejected.
    pub fn set_plan(&self, id: &str, plan: Value) -> anyhow::Result<Run> {
        let run = {
            let mut state = self.write_state();
            let run = state
                .runs
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown run `{id}`"))?;
            if run.plan.is_some() {
                anyhow::bail!("run `{id}` already has a plan");
            }
            run.plan = Some(plan);
            run.updated_at = Utc::now();
            run.clone()
        };
        self.flush.schedule();
        Ok(run)
    }

    pub fn set_paused(&self, id: &str, paused: bool) -> anyhow::Result<Run> {
        let run = {
            let mut state = self.write_state();
            let run = state
                .runs
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown run `{id}`"))?;
            run.paused = paused;
            run.updated_at = Utc::now();
            run.clone()
        };
        self.flush.schedule();
        Ok(run)
    }

    pub fn append_event(&self, id: &str, envelope: EventEnvelope) {
        {
            let mut state = self.write_state();
            if !state.runs.contains_key(id) {
                return;
            }
            let log = state.logs.entry(id.to_string()).or_default();
            log.push_back(envelope);
            while log.len() > EVENT_LOG_CAP {
                log.pop_front();
            }
        }
        self.flush.schedule();
    }

    pub fn get_events(&self, id: &str) -> Vec<EventEnvelope> {
        self.read_state()
            .logs
            .get(id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.write_state();
            state.logs.remove(id);
            state.runs.remove(id).is_some()
        };
        if removed {
            self.bus.clear_run(id);
            self.flush.flush_now();
        }
        removed
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RunsState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RunsState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(instruction: &str) -> RunInput {
        RunInput {
            user_id: "u1".to_string(),
            agent_id: "default".to_string(),
            instruction: instruction.to_string(),
            job_id: None,
        }
    }

    async fn manager(dir: &std::path::Path) -> RunManager {
        RunManager::load(dir.join("runs-state.json"), EventBus::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn created_run_logs_its_creation_event() {
        let dir = tempfile::tempdir().unwrap();
        let runs = manager(dir.path()).await;
        let run = runs.create(input("hello"));
        let events = runs.get_events(&run.id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RunCreated);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runs = manager(dir.path()).await;
        let run = runs.create(input("x"));
        let err = runs
            .update_status(&run.id, RunStatus::Applying, None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid run transition"));
    }

    #[tokio::test]
    async fn observed_event_log_respects_the_fsm() {
        let dir = tempfile::tempdir().unwrap();
        let runs = manager(dir.path()).await;
        let run = runs.create(input("x"));
        runs.advance_to(&run.id, RunStatus::Applying).unwrap();
        runs.update_status(&run.id, RunStatus::Completed, None)
            .unwrap();

        let mut current = RunStatus::Created;
        for event in runs.get_events(&run.id) {
            if event.event_type != EventType::StatusChanged {
                continue;
            }
            let from: RunStatus =
                serde_json::from_value(event.payload["from"].clone()).unwrap();
            let to: RunStatus = serde_json::from_value(event.payload["to"].clone()).unwrap();
            assert_eq!(from, current);
            assert!(from.can_transition(to), "{from} -> {to}");
            current = to;
        }
        assert_eq!(current, RunStatus::Completed);
    }

    #[tokio::test]
    async fn event_log_is_bounded_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let runs = manager(dir.path()).await;
        let run = runs.create(input("x"));
        for i in 0..(EVENT_LOG_CAP + 25) {
            runs.bus().emit(
                &run.id,
                EventType::LlmToken,
                json!({"seq": i}),
                None,
            );
        }
        let events = runs.get_events(&run.id);
        assert_eq!(events.len(), EVENT_LOG_CAP);
        // Oldest envelopes were dropped.
        assert!(events[0].event_id > 1);
    }

    #[tokio::test]
    async fn recovery_marks_non_terminal_runs_failed_and_keeps_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs-state.json");
        let run_id;
        {
            let runs = RunManager::load(path.clone(), EventBus::new()).await.unwrap();
            let run = runs.create(input("interrupted"));
            run_id = run.id.clone();
            runs.update_status(&run.id, RunStatus::Planning, None).unwrap();
            // Give the forced flush a moment to land on disk.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let recovered = RunManager::load(path, EventBus::new()).await.unwrap();
        let run = recovered.get(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let events = recovered.get_events(&run_id);
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::StatusChanged));
    }

    #[tokio::test]
    async fn plan_is_immutable_once_set() {
        let dir = tempfile::tempdir().unwrap();
        let runs = manager(dir.path()).await;
        let run = runs.create(input("x"));
        runs.set_plan(&run.id, json!({"steps": []})).unwrap();
        assert!(runs.set_plan(&run.id, json!({"steps": [1]})).is_err());
    }

    #[tokio::test]
    async fn delete_clears_run_log_and_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let runs = manager(dir.path()).await;
        let run = runs.create(input("x"));
        assert!(runs.delete(&run.id));
        assert!(runs.get(&run.id).is_none());
        assert!(runs.get_events(&run.id).is_empty());
        assert!(!runs.delete(&run.id));
    }
}
