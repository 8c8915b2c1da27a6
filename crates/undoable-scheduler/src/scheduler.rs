use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use croner::Cron;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use undoable_core::persist::{load_versioned, write_json_atomic};
use undoable_types::{now_ms, FireReason, JobPatch, Schedule, ScheduledJob};

use crate::history::{JobHistory, JobMutation};

pub const JOBS_STATE_VERSION: u32 = 1;
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub type PayloadHandler =
    Arc<dyn Fn(ScheduledJob, FireReason) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Sync check consulted before any fire; `true` means dispatch is blocked
/// (daemon paused).
pub type DispatchGate = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobsFile {
    version: u32,
    jobs: Vec<ScheduledJob>,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub jobs: usize,
    pub enabled: usize,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<i64>,
}

pub fn next_occurrence(
    schedule: &Schedule,
    last_fired_at_ms: Option<i64>,
) -> anyhow::Result<Option<i64>> {
    match schedule {
        Schedule::Every(ms) => {
            let base = last_fired_at_ms.unwrap_or_else(now_ms);
            Ok(Some(base + *ms as i64))
        }
        Schedule::Cron(expr) => {
            let cron = expr
                .parse::<Cron>()
                .map_err(|err| anyhow::anyhow!("invalid cron expression `{expr}`: {err}"))?;
            let from = Utc
                .timestamp_millis_opt(last_fired_at_ms.unwrap_or_else(now_ms))
                .single()
                .unwrap_or_else(Utc::now);
            let next = cron
                .find_next_occurrence(&from, false)
                .map_err(|err| anyhow::anyhow!("no next occurrence for `{expr}`: {err}"))?;
            Ok(Some(next.timestamp_millis()))
        }
        Schedule::At(timestamp) => {
            if last_fired_at_ms.is_some() {
                Ok(None)
            } else {
                Ok(Some(*timestamp))
            }
        }
    }
}

struct SchedulerInner {
    jobs: HashMap<String, ScheduledJob>,
}

/// In-memory wheel over the persisted job set, evaluated once per tick.
#[derive(Clone)]
pub struct Scheduler {
    path: PathBuf,
    inner: Arc<RwLock<SchedulerInner>>,
    in_flight: Arc<RwLock<HashSet<String>>>,
    handler: Arc<RwLock<Option<PayloadHandler>>>,
    gate: Arc<RwLock<Option<DispatchGate>>>,
    history: Arc<Mutex<JobHistory>>,
}

impl Scheduler {
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let mut jobs = HashMap::new();
        if let Some(file) = load_versioned::<JobsFile>(&path, JOBS_STATE_VERSION).await? {
            for mut job in file.jobs {
                if job.enabled && job.state.next_wake_at_ms.is_none() {
                    job.state.next_wake_at_ms =
                        next_occurrence(&job.schedule, job.state.last_fired_at_ms)
                            .unwrap_or(None);
                }
                jobs.insert(job.id.clone(), job);
            }
        }
        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(SchedulerInner { jobs })),
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            handler: Arc::new(RwLock::new(None)),
            gate: Arc::new(RwLock::new(None)),
            history: Arc::new(Mutex::new(JobHistory::default())),
        })
    }

    pub async fn set_handler(&self, handler: PayloadHandler) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn set_dispatch_gate(&self, gate: DispatchGate) {
        *self.gate.write().await = Some(gate);
    }

    /// Long-lived tick task. Coarse cadence; `nextWakeAtMs` gives the fine
    /// adjustment inside each tick.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                scheduler.tick().await;
            }
        })
    }

    pub async fn tick(&self) {
        if let Some(gate) = self.gate.read().await.clone() {
            if gate() {
                return;
            }
        }
        let now = now_ms();
        let due = {
            let inner = self.inner.read().await;
            let in_flight = self.in_flight.read().await;
            inner
                .jobs
                .values()
                .filter(|job| {
                    job.enabled
                        && !in_flight.contains(&job.id)
                        && job
                            .state
                            .next_wake_at_ms
                            .map(|wake| now >= wake)
                            .unwrap_or(false)
                })
                .cloned()
                .collect::<Vec<_>>()
        };
        for job in due {
            self.fire(job, FireReason::Due).await;
        }
    }

    /// Fires a job. A job already in flight is never fired concurrently; it
    /// is re-armed only after its handler resolves.
    async fn fire(&self, job: ScheduledJob, reason: FireReason) {
        {
            let mut in_flight = self.in_flight.write().await;
            if !in_flight.insert(job.id.clone()) {
                return;
            }
        }
        let handler = self.handler.read().await.clone();
        let scheduler = self.clone();
        tokio::spawn(async move {
            let fired_at = now_ms();
            if let Some(handler) = handler {
                if let Err(err) = handler(job.clone(), reason).await {
                    tracing::warn!(job = %job.name, error = %err, "job handler failed");
                    scheduler.bump_retry(&job.id).await;
                }
            }
            scheduler.settle_after_fire(&job.id, fired_at).await;
        });
    }

    async fn bump_retry(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.state.retry_count += 1;
        }
    }

    async fn settle_after_fire(&self, id: &str, fired_at: i64) {
        let mut remove_after_run = false;
        {
            let mut inner = self.inner.write().await;
            if let Some(job) = inner.jobs.get_mut(id) {
                job.state.last_fired_at_ms = Some(fired_at);
                job.state.fire_count += 1;
                match &job.schedule {
                    Schedule::At(_) => {
                        job.state.next_wake_at_ms = None;
                        if job.delete_after_run {
                            remove_after_run = true;
                        } else {
                            job.enabled = false;
                        }
                    }
                    schedule => {
                        job.state.next_wake_at_ms =
                            next_occurrence(schedule, Some(fired_at)).unwrap_or(None);
                    }
                }
                job.updated_at = Utc::now();
            }
            if remove_after_run {
                inner.jobs.remove(id);
            }
        }
        self.in_flight.write().await.remove(id);
        let _ = self.persist().await;
    }

    pub async fn add(&self, mut job: ScheduledJob) -> anyhow::Result<ScheduledJob> {
        if job.enabled {
            job.state.next_wake_at_ms =
                next_occurrence(&job.schedule, job.state.last_fired_at_ms)?;
        }
        let added = self.insert_job(job).await?;
        self.history
            .lock()
            .await
            .record(JobMutation::Create { after: added.clone() });
        Ok(added)
    }

    async fn insert_job(&self, job: ScheduledJob) -> anyhow::Result<ScheduledJob> {
        {
            let mut inner = self.inner.write().await;
            if inner.jobs.contains_key(&job.id) {
                anyhow::bail!("job `{}` already exists", job.id);
            }
            inner.jobs.insert(job.id.clone(), job.clone());
        }
        self.persist().await?;
        Ok(job)
    }

    /// Adds a job without touching user history. Used for jobs mirrored from
    /// workflow nodes.
    pub async fn add_unrecorded(&self, mut job: ScheduledJob) -> anyhow::Result<ScheduledJob> {
        if job.enabled {
            job.state.next_wake_at_ms =
                next_occurrence(&job.schedule, job.state.last_fired_at_ms)?;
        }
        self.insert_job(job).await
    }

    pub async fn remove_unrecorded(&self, id: &str) -> anyhow::Result<ScheduledJob> {
        self.take_job(id).await
    }

    pub async fn update(&self, id: &str, patch: JobPatch) -> anyhow::Result<ScheduledJob> {
        let (before, after) = self.apply_patch(id, patch).await?;
        self.history
            .lock()
            .await
            .record(JobMutation::Update {
                before,
                after: after.clone(),
            });
        Ok(after)
    }

    async fn apply_patch(
        &self,
        id: &str,
        patch: JobPatch,
    ) -> anyhow::Result<(ScheduledJob, ScheduledJob)> {
        let (before, after) = {
            let mut inner = self.inner.write().await;
            let job = inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown job `{id}`"))?;
            let before = job.clone();
            if let Some(name) = patch.name {
                job.name = name;
            }
            if let Some(description) = patch.description {
                job.description = Some(description);
            }
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
            }
            if let Some(schedule) = patch.schedule {
                job.schedule = schedule;
                job.state.next_wake_at_ms = None;
            }
            if let Some(payload) = patch.payload {
                job.payload = payload;
            }
            if let Some(delete_after_run) = patch.delete_after_run {
                job.delete_after_run = delete_after_run;
            }
            if job.enabled && job.state.next_wake_at_ms.is_none() {
                job.state.next_wake_at_ms =
                    next_occurrence(&job.schedule, job.state.last_fired_at_ms)?;
            }
            job.updated_at = Utc::now();
            (before, job.clone())
        };
        self.persist().await?;
        Ok((before, after))
    }

    async fn replace_job(&self, job: ScheduledJob) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.jobs.insert(job.id.clone(), job);
        }
        self.persist().await
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<ScheduledJob> {
        let removed = self.take_job(id).await?;
        self.history
            .lock()
            .await
            .record(JobMutation::Delete {
                before: removed.clone(),
            });
        Ok(removed)
    }

    async fn take_job(&self, id: &str) -> anyhow::Result<ScheduledJob> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner
                .jobs
                .remove(id)
                .ok_or_else(|| anyhow::anyhow!("unknown job `{id}`"))?
        };
        self.persist().await?;
        Ok(removed)
    }

    /// `due` fires only when the wake time has passed; `force` fires now.
    pub async fn run(&self, id: &str, reason: FireReason) -> anyhow::Result<bool> {
        let job = self
            .get(id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown job `{id}`"))?;
        if self.in_flight.read().await.contains(id) {
            return Ok(false);
        }
        let due = job
            .state
            .next_wake_at_ms
            .map(|wake| now_ms() >= wake)
            .unwrap_or(false);
        match reason {
            FireReason::Due if !(job.enabled && due) => Ok(false),
            reason => {
                self.fire(job, reason).await;
                Ok(true)
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    pub async fn list(&self, include_disabled: bool) -> Vec<ScheduledJob> {
        let mut jobs = self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|job| include_disabled || job.enabled)
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub async fn status(&self) -> SchedulerStatus {
        let inner = self.inner.read().await;
        let in_flight = self.in_flight.read().await.len();
        let enabled = inner.jobs.values().filter(|job| job.enabled).count();
        let next_wake_at_ms = inner
            .jobs
            .values()
            .filter(|job| job.enabled)
            .filter_map(|job| job.state.next_wake_at_ms)
            .min();
        SchedulerStatus {
            jobs: inner.jobs.len(),
            enabled,
            in_flight,
            next_wake_at_ms,
        }
    }

    /// Replays the inverse of the most recent recorded mutation through the
    /// scheduler itself.
    pub async fn undo_last(&self) -> anyhow::Result<Option<String>> {
        let mutation = self.history.lock().await.pop_undo();
        let Some(mutation) = mutation else {
            return Ok(None);
        };
        let kind = mutation.kind();
        match mutation {
            JobMutation::Create { after } => {
                let _ = self.take_job(&after.id).await?;
            }
            JobMutation::Update { before, .. } => {
                self.replace_job(before).await?;
            }
            JobMutation::Delete { before } => {
                self.insert_job(before).await?;
            }
        }
        Ok(Some(kind.to_string()))
    }

    pub async fn redo_last(&self) -> anyhow::Result<Option<String>> {
        let mutation = self.history.lock().await.pop_redo();
        let Some(mutation) = mutation else {
            return Ok(None);
        };
        let kind = mutation.kind();
        match mutation {
            JobMutation::Create { after } => {
                self.insert_job(after).await?;
            }
            JobMutation::Update { after, .. } => {
                self.replace_job(after).await?;
            }
            JobMutation::Delete { before } => {
                let _ = self.take_job(&before.id).await?;
            }
        }
        Ok(Some(kind.to_string()))
    }

    pub async fn history_depths(&self) -> (usize, usize) {
        self.history.lock().await.depths()
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = {
            let inner = self.inner.read().await;
            let mut jobs = inner.jobs.values().cloned().collect::<Vec<_>>();
            jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            JobsFile {
                version: JOBS_STATE_VERSION,
                jobs,
                saved_at: Utc::now(),
            }
        };
        write_json_atomic(&self.path, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn scheduler(dir: &std::path::Path) -> Scheduler {
        Scheduler::load(dir.join("jobs-state.json")).await.unwrap()
    }

    fn every_job(name: &str, ms: u64) -> ScheduledJob {
        ScheduledJob::new(name, Schedule::Every(ms), json!({"kind": "noop"}))
    }

    #[tokio::test]
    async fn add_arms_the_next_wake() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let job = sched.add(every_job("a", 60_000)).await.unwrap();
        let wake = job.state.next_wake_at_ms.unwrap();
        assert!(wake > now_ms());
        assert!(wake <= now_ms() + 61_000);
    }

    #[tokio::test]
    async fn cron_next_occurrence_is_in_the_future() {
        let next = next_occurrence(&Schedule::Cron("*/5 * * * *".to_string()), None)
            .unwrap()
            .unwrap();
        assert!(next > now_ms());
        // Five-minute cadence: never more than 5 minutes out.
        assert!(next <= now_ms() + 5 * 60 * 1_000);
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_at_add() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let job = ScheduledJob::new(
            "broken",
            Schedule::Cron("not a cron".to_string()),
            json!({}),
        );
        assert!(sched.add(job).await.is_err());
    }

    #[tokio::test]
    async fn force_run_fires_and_rearms_after_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        sched
            .set_handler(Arc::new(move |_job, _reason| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;
        let job = sched.add(every_job("a", 3_600_000)).await.unwrap();
        assert!(sched.run(&job.id, FireReason::Force).await.unwrap());
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) == 1
                && !sched.in_flight.read().await.contains(&job.id)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let job = sched.get(&job.id).await.unwrap();
        assert_eq!(job.state.fire_count, 1);
        assert!(job.state.next_wake_at_ms.unwrap() > now_ms());
    }

    #[tokio::test]
    async fn one_shot_at_job_disables_or_deletes_after_fire() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        sched
            .set_handler(Arc::new(|_job, _reason| Box::pin(async { Ok(()) })))
            .await;

        let keep = ScheduledJob::new("keep", Schedule::At(now_ms() - 10), json!({}));
        let keep = sched.add(keep).await.unwrap();
        let mut gone = ScheduledJob::new("gone", Schedule::At(now_ms() - 10), json!({}));
        gone.delete_after_run = true;
        let gone = sched.add(gone).await.unwrap();

        sched.tick().await;
        for _ in 0..100 {
            if sched.in_flight.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let kept = sched.get(&keep.id).await.unwrap();
        assert!(!kept.enabled);
        assert!(kept.state.next_wake_at_ms.is_none());
        assert!(sched.get(&gone.id).await.is_none());
    }

    #[tokio::test]
    async fn paused_gate_blocks_tick_fires() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        sched
            .set_handler(Arc::new(move |_job, _reason| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;
        sched.set_dispatch_gate(Arc::new(|| true)).await;
        let job = ScheduledJob::new("due", Schedule::At(now_ms() - 10), json!({}));
        sched.add(job).await.unwrap();
        sched.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scenario_s5_update_undo_redo() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let job = sched.add(every_job("A", 60_000)).await.unwrap();
        sched
            .update(
                &job.id,
                JobPatch {
                    schedule: Some(Schedule::Cron("*/5 * * * *".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            sched.get(&job.id).await.unwrap().schedule,
            Schedule::Cron(_)
        ));

        sched.undo_last().await.unwrap();
        assert_eq!(
            sched.get(&job.id).await.unwrap().schedule,
            Schedule::Every(60_000)
        );

        sched.redo_last().await.unwrap();
        assert!(matches!(
            sched.get(&job.id).await.unwrap().schedule,
            Schedule::Cron(_)
        ));
    }

    #[tokio::test]
    async fn history_inverse_restores_initial_job_set() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;

        let a = sched.add(every_job("a", 1_000)).await.unwrap();
        sched
            .update(
                &a.id,
                JobPatch {
                    name: Some("a2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        sched.remove(&a.id).await.unwrap();
        let _b = sched.add(every_job("b", 2_000)).await.unwrap();

        for _ in 0..4 {
            sched.undo_last().await.unwrap();
        }
        assert!(sched.list(true).await.is_empty());
        assert_eq!(sched.history_depths().await, (0, 4));
    }

    #[tokio::test]
    async fn new_mutation_clears_redo() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let a = sched.add(every_job("a", 1_000)).await.unwrap();
        sched.undo_last().await.unwrap();
        assert_eq!(sched.history_depths().await.1, 1);
        let _ = a;
        sched.add(every_job("c", 3_000)).await.unwrap();
        assert_eq!(sched.history_depths().await.1, 0);
        assert!(sched.redo_last().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn jobs_survive_reload_with_rearmed_wakes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs-state.json");
        let id = {
            let sched = Scheduler::load(path.clone()).await.unwrap();
            let job = sched.add(every_job("persisted", 60_000)).await.unwrap();
            job.id
        };
        let sched = Scheduler::load(path).await.unwrap();
        let job = sched.get(&id).await.unwrap();
        assert_eq!(job.name, "persisted");
        assert!(job.state.next_wake_at_ms.is_some());
    }
}
