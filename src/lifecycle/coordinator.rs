// ABOUTME: Owns the JobState table and drives job lifecycle transitions.
// ABOUTME: Handles pause (cooperative cancellation), checkpointing, and resume.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::cancel::Cancellable;
use super::job::{ArtifactSlot, JobPatch, JobSpec, JobState, UnitStatus, UnitUpdate};
use super::state::{JobEvent, JobPhase, JobStateMachine};
use super::store::CheckpointStore;

/// Everything needed to continue a paused job without redoing finished work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeContext {
    pub job_id: String,
    /// Units whose status is completed.
    pub completed_units: Vec<usize>,
    /// Every other unit. Together with `completed_units` this is the full
    /// index set.
    pub pending_units: Vec<usize>,
    /// Result payloads of the completed units.
    pub unit_results: BTreeMap<usize, Value>,
    /// Artifacts already produced; these must not be generated again.
    pub artifacts: BTreeMap<ArtifactSlot, Value>,
    pub completed_steps: u32,
    pub total_steps: u32,
    /// Seconds spent paused so far.
    pub total_pause_duration: f64,
}

type Handles = HashMap<String, Arc<dyn Cancellable>>;

/// Checkpoint ordering for one job. Versions are issued under the jobs lock;
/// `written` is held across the store call so older blobs never overwrite
/// newer ones.
#[derive(Default)]
struct Persist {
    issued: u64,
    written: Arc<Mutex<u64>>,
}

/// A serialized job waiting to be written to the store.
struct Checkpoint {
    version: u64,
    blob: Value,
    written: Arc<Mutex<u64>>,
}

#[derive(Default)]
struct Jobs {
    states: HashMap<String, JobState>,
    handles: HashMap<String, Handles>,
    persist: HashMap<String, Persist>,
}

impl Jobs {
    /// Serialize a live job and stamp it with the next version.
    fn checkpoint(&mut self, job_id: &str) -> Option<Checkpoint> {
        let blob = self.states.get(job_id).and_then(serialize)?;
        let persist = self.persist.entry(job_id.to_string()).or_default();
        persist.issued += 1;
        Some(Checkpoint {
            version: persist.issued,
            blob,
            written: persist.written.clone(),
        })
    }

    /// Cancel and forget every registered handle of a job.
    fn cancel_handles(&mut self, job_id: &str) -> usize {
        let handles = self.handles.remove(job_id).unwrap_or_default();
        let mut cancelled = 0;
        for handle in handles.values() {
            if !handle.is_done() {
                handle.cancel();
                cancelled += 1;
            }
        }
        if let Some(job) = self.states.get_mut(job_id) {
            job.active_unit_ids.clear();
        }
        cancelled
    }
}

/// Serialize a job for the checkpoint store, logging if that fails.
fn serialize(job: &JobState) -> Option<Value> {
    match serde_json::to_value(job) {
        Ok(blob) => Some(blob),
        Err(e) => {
            tracing::warn!(job_id = %job.job_id, error = %e, "failed to serialize job state");
            None
        }
    }
}

/// Mark every in-progress unit of a job as cancelled.
fn cancel_running_units(job: &mut JobState) -> usize {
    let running = job.units_with(|status| status == UnitStatus::InProgress);
    for index in &running {
        job.apply_unit(*index, UnitUpdate::new(UnitStatus::Cancelled));
    }
    running.len()
}

/// Job lifecycle coordinator.
///
/// Owns every live [`JobState`]; callers refer to jobs by id and receive
/// snapshots. Checkpoints are written to the injected [`CheckpointStore`] on
/// a best-effort basis: store failures are logged and never surfaced, since
/// the in-memory table is authoritative for a live job.
///
/// Invalid requests (unknown job, a transition the state machine refuses)
/// return `false` and leave the job untouched.
pub struct LifecycleCoordinator {
    jobs: Mutex<Jobs>,
    store: Arc<dyn CheckpointStore>,
}

impl LifecycleCoordinator {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            jobs: Mutex::new(Jobs::default()),
            store,
        }
    }

    /// Register a new job in `Initializing` with every unit pending.
    ///
    /// Registering an id that is already live replaces it; any handles of the
    /// old job are cancelled.
    pub async fn register_job(
        &self,
        job_id: &str,
        user_id: &str,
        spec: JobSpec,
        options: Value,
    ) -> JobState {
        let job = JobState::new(job_id, user_id, spec, options);
        let checkpoint = {
            let mut jobs = self.jobs.lock().await;
            if jobs.states.contains_key(job_id) {
                tracing::warn!(job_id = %job_id, "job re-registered, replacing previous state");
                jobs.cancel_handles(job_id);
            }
            jobs.states.insert(job_id.to_string(), job.clone());
            jobs.checkpoint(job_id)
        };

        tracing::info!(
            job_id = %job_id,
            user_id = %user_id,
            units = job.unit_states.len(),
            total_steps = job.total_steps,
            "job registered"
        );
        self.save(job_id, checkpoint).await;
        job
    }

    /// Snapshot of a live job.
    pub async fn get_job(&self, job_id: &str) -> Option<JobState> {
        self.jobs.lock().await.states.get(job_id).cloned()
    }

    /// Snapshots of a user's live jobs, ordered by creation time.
    pub async fn list_jobs(&self, user_id: &str) -> Vec<JobState> {
        let jobs = self.jobs.lock().await;
        let mut owned: Vec<JobState> = jobs
            .states
            .values()
            .filter(|job| job.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        owned
    }

    /// Number of jobs held in memory.
    pub async fn active_job_count(&self) -> usize {
        self.jobs.lock().await.states.len()
    }

    /// Apply a patch to a job and checkpoint it.
    pub async fn update_job(&self, job_id: &str, patch: JobPatch) -> bool {
        let checkpoint = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.states.get_mut(job_id) else {
                tracing::warn!(job_id = %job_id, "update for unknown job ignored");
                return false;
            };
            job.apply(patch);
            jobs.checkpoint(job_id)
        };
        self.save(job_id, checkpoint).await;
        true
    }

    /// Change the status of one work unit.
    ///
    /// The job is checkpointed when the unit reaches a terminal status.
    pub async fn update_unit(&self, job_id: &str, index: usize, update: UnitUpdate) -> bool {
        let terminal = update.status.is_terminal();
        let checkpoint = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.states.get_mut(job_id) else {
                tracing::warn!(job_id = %job_id, index, "unit update for unknown job ignored");
                return false;
            };
            let status = update.status;
            if !job.apply_unit(index, update) {
                tracing::warn!(job_id = %job_id, index, "unit update for unknown unit ignored");
                return false;
            }
            tracing::debug!(job_id = %job_id, index, status = %status, "unit updated");
            if terminal {
                jobs.checkpoint(job_id)
            } else {
                None
            }
        };
        if terminal {
            self.save(job_id, checkpoint).await;
        }
        true
    }

    /// Clear an artifact slot so it can be produced again.
    pub async fn invalidate_artifact(&self, job_id: &str, slot: ArtifactSlot) -> bool {
        let checkpoint = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.states.get_mut(job_id) else {
                return false;
            };
            if job.artifacts.remove(&slot).is_none() {
                return false;
            }
            job.touch();
            jobs.checkpoint(job_id)
        };
        tracing::debug!(job_id = %job_id, slot = ?slot, "artifact invalidated");
        self.save(job_id, checkpoint).await;
        true
    }

    /// Apply a lifecycle event.
    ///
    /// `Pause` and `Resume` are routed to [`pause`](Self::pause) and
    /// [`mark_resumed`](Self::mark_resumed). `Cancel` also cancels running
    /// units; entering any terminal phase cancels outstanding handles.
    pub async fn transition(&self, job_id: &str, event: JobEvent) -> bool {
        match event {
            JobEvent::Pause => return self.pause(job_id).await,
            JobEvent::Resume => return self.mark_resumed(job_id).await,
            _ => {}
        }

        let checkpoint = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.states.get_mut(job_id) else {
                tracing::warn!(job_id = %job_id, event = %event, "transition for unknown job ignored");
                return false;
            };

            let from = job.state;
            let next = match JobStateMachine::transition(from, event) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "transition rejected");
                    return false;
                }
            };

            job.state = next;
            if event == JobEvent::Cancel {
                cancel_running_units(job);
            }
            if next.is_terminal() {
                job.finished_at = Some(Utc::now());
            }
            job.touch();
            tracing::info!(job_id = %job_id, from = %from, to = %next, "job transitioned");

            if next.is_terminal() {
                jobs.cancel_handles(job_id);
            }
            jobs.checkpoint(job_id)
        };

        self.save(job_id, checkpoint).await;
        true
    }

    /// Associate a cancellable handle with a running unit of a job.
    pub async fn register_unit_task(
        &self,
        job_id: &str,
        task_id: &str,
        handle: Arc<dyn Cancellable>,
    ) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.states.get_mut(job_id) else {
            tracing::warn!(job_id = %job_id, task_id = %task_id, "handle for unknown job ignored");
            return false;
        };
        job.active_unit_ids.insert(task_id.to_string());
        jobs.handles
            .entry(job_id.to_string())
            .or_default()
            .insert(task_id.to_string(), handle);
        true
    }

    /// Forget the handle of a unit that has finished.
    pub async fn unregister_unit_task(&self, job_id: &str, task_id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.states.get_mut(job_id) {
            job.active_unit_ids.remove(task_id);
        }
        let Some(handles) = jobs.handles.get_mut(job_id) else {
            return false;
        };
        let removed = handles.remove(task_id).is_some();
        if handles.is_empty() {
            jobs.handles.remove(job_id);
        }
        removed
    }

    /// Pause a job, cancelling its running units.
    ///
    /// Only accepted from `UnitsInProgress` or `MediaReady`. Handles are
    /// signalled but not awaited; units still marked in progress are recorded
    /// as cancelled so they are regenerated on resume.
    pub async fn pause(&self, job_id: &str) -> bool {
        let checkpoint = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.states.get(job_id) else {
                tracing::warn!(job_id = %job_id, "pause for unknown job ignored");
                return false;
            };
            let next = match JobStateMachine::transition(job.state, JobEvent::Pause) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "pause rejected");
                    return false;
                }
            };

            let signalled = jobs.cancel_handles(job_id);
            let Some(job) = jobs.states.get_mut(job_id) else {
                return false;
            };
            let cancelled_units = cancel_running_units(job);
            job.state = next;
            job.pause_time = Some(Utc::now());
            job.touch();

            tracing::info!(
                job_id = %job_id,
                signalled,
                cancelled_units,
                "job paused"
            );
            jobs.checkpoint(job_id)
        };

        self.save(job_id, checkpoint).await;
        true
    }

    /// Whether a job is paused and can be resumed.
    ///
    /// Jobs not in memory are loaded from the checkpoint store first, so a
    /// job paused before a restart can be picked up again.
    pub async fn can_resume(&self, job_id: &str) -> bool {
        if let Some(job) = self.jobs.lock().await.states.get(job_id) {
            return job.state == JobPhase::Paused;
        }

        let blob = match self.store.load(job_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "failed to load checkpoint");
                return false;
            }
        };

        let mut restored: JobState = match serde_json::from_value(blob) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "checkpoint is not a valid job state");
                return false;
            }
        };
        if restored.state != JobPhase::Paused {
            tracing::info!(
                job_id = %job_id,
                state = %restored.state,
                "checkpoint is not paused, not restored"
            );
            return false;
        }
        // Handles do not survive a restart.
        restored.active_unit_ids.clear();

        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .states
            .entry(job_id.to_string())
            .or_insert(restored);
        tracing::info!(job_id = %job_id, state = %job.state, "job restored from checkpoint");
        job.state == JobPhase::Paused
    }

    /// Partition a job's units into completed and still-to-do work.
    pub async fn get_resume_context(&self, job_id: &str) -> Option<ResumeContext> {
        let jobs = self.jobs.lock().await;
        let job = jobs.states.get(job_id)?;

        let completed_units = job.units_with(|status| status == UnitStatus::Completed);
        let pending_units = job.units_with(|status| status.needs_work());
        let unit_results = completed_units
            .iter()
            .filter_map(|index| {
                let data = job.unit_states.get(index)?.data.clone()?;
                Some((*index, data))
            })
            .collect();

        Some(ResumeContext {
            job_id: job.job_id.clone(),
            completed_units,
            pending_units,
            unit_results,
            artifacts: job.artifacts.clone(),
            completed_steps: job.completed_steps,
            total_steps: job.total_steps,
            total_pause_duration: job.total_pause_duration,
        })
    }

    /// Move a paused job back to `UnitsInProgress`, accumulating the time it
    /// spent paused.
    pub async fn mark_resumed(&self, job_id: &str) -> bool {
        let checkpoint = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.states.get_mut(job_id) else {
                tracing::warn!(job_id = %job_id, "resume for unknown job ignored");
                return false;
            };
            let next = match JobStateMachine::transition(job.state, JobEvent::Resume) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "resume rejected");
                    return false;
                }
            };

            let resume_time = Utc::now();
            job.resume_time = Some(resume_time);
            if let Some(pause_time) = job.pause_time {
                let paused = (resume_time - pause_time)
                    .num_microseconds()
                    .map_or(0.0, |us| us.max(0) as f64 / 1_000_000.0);
                job.total_pause_duration += paused;
            }
            job.state = next;
            job.pause_time = None;
            job.resume_time = None;
            job.touch();

            tracing::info!(
                job_id = %job_id,
                total_pause_secs = job.total_pause_duration,
                "job resumed"
            );
            jobs.checkpoint(job_id)
        };

        self.save(job_id, checkpoint).await;
        true
    }

    /// Drop a job from memory, cancelling anything still running and
    /// archiving its final state.
    pub async fn cleanup(&self, job_id: &str) -> bool {
        let (removed, checkpoint) = {
            let mut jobs = self.jobs.lock().await;
            let signalled = jobs.cancel_handles(job_id);
            let checkpoint = jobs.checkpoint(job_id);
            let removed = jobs.states.remove(job_id);
            jobs.persist.remove(job_id);
            if signalled > 0 {
                tracing::debug!(job_id = %job_id, signalled, "cancelled handles during cleanup");
            }
            (removed, checkpoint)
        };

        let Some(job) = removed else {
            return false;
        };
        tracing::info!(job_id = %job_id, state = %job.state, "job cleaned up");

        if let Some(checkpoint) = checkpoint {
            self.write(job_id, checkpoint, true).await;
        }
        true
    }

    /// Cancel every registered handle and checkpoint every live job.
    pub async fn shutdown(&self) {
        let checkpoints: Vec<(String, Checkpoint)> = {
            let mut jobs = self.jobs.lock().await;
            let handle_ids: Vec<String> = jobs.handles.keys().cloned().collect();
            for job_id in &handle_ids {
                jobs.cancel_handles(job_id);
            }
            let job_ids: Vec<String> = jobs.states.keys().cloned().collect();
            job_ids
                .into_iter()
                .filter_map(|job_id| {
                    let checkpoint = jobs.checkpoint(&job_id)?;
                    Some((job_id, checkpoint))
                })
                .collect()
        };

        let count = checkpoints.len();
        futures::future::join_all(
            checkpoints
                .into_iter()
                .map(|(job_id, checkpoint)| async move { self.write(&job_id, checkpoint, false).await }),
        )
        .await;
        tracing::info!(jobs = count, "lifecycle coordinator shut down");
    }

    async fn save(&self, job_id: &str, checkpoint: Option<Checkpoint>) {
        if let Some(checkpoint) = checkpoint {
            self.write(job_id, checkpoint, false).await;
        }
    }

    /// Write a checkpoint unless a newer one for the same job already went
    /// out. Holding `written` across the store call keeps writes in version
    /// order.
    async fn write(&self, job_id: &str, checkpoint: Checkpoint, archive: bool) {
        let mut written = checkpoint.written.lock().await;
        if *written >= checkpoint.version {
            tracing::debug!(
                job_id = %job_id,
                version = checkpoint.version,
                latest = *written,
                "stale checkpoint skipped"
            );
            return;
        }

        let result = if archive {
            self.store.archive(job_id, &checkpoint.blob).await
        } else {
            self.store.save(job_id, &checkpoint.blob).await
        };
        *written = checkpoint.version;

        if let Err(e) = result {
            let action = if archive { "archive" } else { "persist" };
            tracing::warn!(job_id = %job_id, error = %e, "failed to {} checkpoint", action);
        }
    }
}
