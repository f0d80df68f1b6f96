// ABOUTME: Admission gateway for generation jobs and their work units.
// ABOUTME: Combines global/API/per-user semaphores, a job lock table, and the rate limiter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::rate_limiter::RateLimiter;
use crate::config::Limits;
use crate::error::{AdmissionError, ConfigError};
use crate::task_id::job_id_of;

/// How long `acquire_job_lock` waits on a contended job mutex before giving up.
const JOB_LOCK_WAIT: Duration = Duration::from_millis(1);

/// Bookkeeping status of one admitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered and holding (or acquiring) its permits.
    Running,
    /// Released through `release_for_user`.
    Completed,
    /// Admission faulted after registration and was rolled back.
    Failed,
}

/// Aggregate admission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub completed_requests: u64,
    pub active_users: usize,
    pub active_tasks: usize,
    /// Bookkeeping entries currently in [`TaskStatus::Running`].
    pub running_tasks: usize,
}

/// Permits held by one admitted task. Dropping it releases all three.
struct Permits {
    _global: OwnedSemaphorePermit,
    _user: OwnedSemaphorePermit,
    _api: OwnedSemaphorePermit,
}

struct TaskRecord {
    status: TaskStatus,
    finished_at: Option<Instant>,
    permits: Option<Permits>,
}

impl TaskRecord {
    fn running() -> Self {
        Self {
            status: TaskStatus::Running,
            finished_at: None,
            permits: None,
        }
    }

    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.finished_at = Some(Instant::now());
        self.permits = None;
    }
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    rejected_requests: u64,
    completed_requests: u64,
}

/// Mutable admission state, protected by a single mutex.
#[derive(Default)]
struct AdmissionState {
    user_semaphores: HashMap<String, Arc<Semaphore>>,
    user_tasks: HashMap<String, HashSet<String>>,
    records: HashMap<(String, String), TaskRecord>,
    counters: Counters,
}

impl AdmissionState {
    fn active_count(&self, user_id: &str) -> usize {
        self.user_tasks.get(user_id).map_or(0, HashSet::len)
    }

    /// Remove a task from its user's active set. Returns whether it was there.
    fn deregister(&mut self, user_id: &str, task_id: &str) -> bool {
        let Some(tasks) = self.user_tasks.get_mut(user_id) else {
            return false;
        };
        let removed = tasks.remove(task_id);
        if tasks.is_empty() {
            // No admission for this user is in flight, so its semaphore has
            // every permit back and can be recreated on demand.
            self.user_tasks.remove(user_id);
            self.user_semaphores.remove(user_id);
        }
        removed
    }

    fn prune(&mut self, retention: Duration) {
        if retention.is_zero() {
            return;
        }
        self.records.retain(|_, record| match record.finished_at {
            Some(finished) => finished.elapsed() < retention,
            None => true,
        });
    }
}

/// Per-job mutual exclusion. A job is running exactly while its guard is held.
#[derive(Default)]
struct JobLocks {
    mutexes: HashMap<String, Arc<Mutex<()>>>,
    held: HashMap<String, OwnedMutexGuard<()>>,
}

/// Single gateway through which every job and work unit is admitted.
///
/// # Admission order
///
/// [`acquire_for_user`](Self::acquire_for_user) checks the cheap per-user cap
/// first, then acquires resources in order of increasing contention: the
/// global semaphore, the user's semaphore, the API semaphore, and finally a
/// rate limiter slot.
///
/// The per-user cap check and the task registration share one critical
/// section, so the cap is never exceeded. Waiters on the semaphores are not
/// served in any guaranteed order.
pub struct ConcurrencyManager {
    limits: Limits,
    global: Arc<Semaphore>,
    api: Arc<Semaphore>,
    rate_limiter: RateLimiter,
    job_locks: Mutex<JobLocks>,
    state: Mutex<AdmissionState>,
}

impl ConcurrencyManager {
    /// Create a manager enforcing `limits`.
    pub fn new(limits: Limits) -> Result<Self, ConfigError> {
        limits.validate()?;
        let rate_limiter = RateLimiter::new(limits.api_calls_per_minute, limits.api_calls_per_hour);
        Ok(Self::with_rate_limiter(limits, rate_limiter))
    }

    /// Create a manager with an explicitly built rate limiter.
    ///
    /// `limits` is assumed to be valid; the rate fields are ignored in favour
    /// of `rate_limiter`.
    pub fn with_rate_limiter(limits: Limits, rate_limiter: RateLimiter) -> Self {
        Self {
            global: Arc::new(Semaphore::new(limits.max_global_concurrent_units)),
            api: Arc::new(Semaphore::new(limits.max_api_concurrent_calls)),
            rate_limiter,
            job_locks: Mutex::new(JobLocks::default()),
            state: Mutex::new(AdmissionState::default()),
            limits,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Whether `job_id` currently holds its job lock.
    pub async fn is_job_running(&self, job_id: &str) -> bool {
        self.job_locks.lock().await.held.contains_key(job_id)
    }

    /// Try to take exclusive ownership of a job.
    ///
    /// Returns `false` without queuing if the job is already running or its
    /// mutex cannot be taken within about a millisecond.
    pub async fn acquire_job_lock(&self, job_id: &str) -> bool {
        let mutex = {
            let mut locks = self.job_locks.lock().await;
            if locks.held.contains_key(job_id) {
                tracing::debug!(job_id = %job_id, "job already running");
                return false;
            }
            locks
                .mutexes
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = match tokio::time::timeout(JOB_LOCK_WAIT, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(job_id = %job_id, "job lock contended");
                return false;
            }
        };

        self.job_locks
            .lock()
            .await
            .held
            .insert(job_id.to_string(), guard);
        tracing::debug!(job_id = %job_id, "job lock acquired");
        true
    }

    /// Release a job lock. Releasing a job that is not locked is a no-op.
    pub async fn release_job_lock(&self, job_id: &str) {
        let mut locks = self.job_locks.lock().await;
        if locks.held.remove(job_id).is_none() {
            return;
        }

        // Clones of a job mutex are only made under this lock, so a count of
        // one means nobody is waiting on it.
        if locks
            .mutexes
            .get(job_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.mutexes.remove(job_id);
        }
        tracing::debug!(job_id = %job_id, "job lock released");
    }

    /// Admit one task for a user.
    ///
    /// Returns `Ok(false)` when the user is at their cap or already has a task
    /// with this id running. Returns `Err` if a semaphore is closed while
    /// acquiring; every permit taken so far is released and the task is
    /// deregistered before returning.
    pub async fn acquire_for_user(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<bool, AdmissionError> {
        let user_semaphore = {
            let mut state = self.state.lock().await;
            state.counters.total_requests += 1;

            let active = state.active_count(user_id);
            if active >= self.limits.max_units_per_user {
                state.counters.rejected_requests += 1;
                tracing::warn!(
                    user_id = %user_id,
                    task_id = %task_id,
                    active,
                    limit = self.limits.max_units_per_user,
                    "per-user limit reached, admission rejected"
                );
                return Ok(false);
            }

            let tasks = state.user_tasks.entry(user_id.to_string()).or_default();
            if !tasks.insert(task_id.to_string()) {
                state.counters.rejected_requests += 1;
                tracing::warn!(user_id = %user_id, task_id = %task_id, "task already admitted");
                return Ok(false);
            }

            state.records.insert(
                (user_id.to_string(), task_id.to_string()),
                TaskRecord::running(),
            );

            let per_user = self.limits.max_units_per_user;
            state
                .user_semaphores
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(per_user)))
                .clone()
        };

        match self.acquire_permits(user_semaphore).await {
            Ok(permits) => {
                let mut state = self.state.lock().await;
                let key = (user_id.to_string(), task_id.to_string());
                // Released while we were waiting: the permits drop here.
                if let Some(record) = state.records.get_mut(&key) {
                    if record.status == TaskStatus::Running {
                        record.permits = Some(permits);
                    }
                }
                tracing::debug!(user_id = %user_id, task_id = %task_id, "task admitted");
                Ok(true)
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                state.deregister(user_id, task_id);
                if let Some(record) = state
                    .records
                    .get_mut(&(user_id.to_string(), task_id.to_string()))
                {
                    record.finish(TaskStatus::Failed);
                }
                tracing::warn!(
                    user_id = %user_id,
                    task_id = %task_id,
                    error = %err,
                    "admission failed, rolled back"
                );
                Err(err)
            }
        }
    }

    /// Acquire global, per-user, API and rate limiter capacity in that order.
    /// An early return drops whichever permits were already taken.
    async fn acquire_permits(&self, user: Arc<Semaphore>) -> Result<Permits, AdmissionError> {
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed { resource: "global" })?;
        let user = user
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed { resource: "per-user" })?;
        let api = self
            .api
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed { resource: "api" })?;

        self.rate_limiter.acquire().await;

        Ok(Permits {
            _global: global,
            _user: user,
            _api: api,
        })
    }

    /// Release a task admitted by [`acquire_for_user`](Self::acquire_for_user).
    ///
    /// Unknown tasks are ignored. Finished bookkeeping older than the
    /// configured retention window is pruned on the way out.
    pub async fn release_for_user(&self, user_id: &str, task_id: &str) {
        let mut state = self.state.lock().await;

        let was_active = state.deregister(user_id, task_id);
        if let Some(record) = state
            .records
            .get_mut(&(user_id.to_string(), task_id.to_string()))
        {
            if record.status == TaskStatus::Running {
                record.finish(TaskStatus::Completed);
            }
        }

        if was_active {
            state.counters.completed_requests += 1;
            tracing::debug!(user_id = %user_id, task_id = %task_id, "task released");
        } else {
            tracing::debug!(user_id = %user_id, task_id = %task_id, "release of unknown task ignored");
        }

        state.prune(self.limits.cleanup_completed_after);
    }

    /// Number of tasks the user currently has admitted.
    pub async fn get_user_active_count(&self, user_id: &str) -> usize {
        self.state.lock().await.active_count(user_id)
    }

    /// Distinct job ids among the user's active tasks, sorted.
    ///
    /// Only task ids that follow the [`task_id`](crate::task_id) naming
    /// protocol contribute.
    pub async fn get_user_active_decks(&self, user_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut decks: Vec<String> = state
            .user_tasks
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|task_id| job_id_of(task_id))
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        decks.sort();
        decks
    }

    /// Bookkeeping status of a task, if it has not been pruned.
    pub async fn task_status(&self, user_id: &str, task_id: &str) -> Option<TaskStatus> {
        self.state
            .lock()
            .await
            .records
            .get(&(user_id.to_string(), task_id.to_string()))
            .map(|record| record.status)
    }

    /// Snapshot of the aggregate counters.
    pub async fn get_stats(&self) -> AdmissionStats {
        let state = self.state.lock().await;
        AdmissionStats {
            total_requests: state.counters.total_requests,
            rejected_requests: state.counters.rejected_requests,
            completed_requests: state.counters.completed_requests,
            active_users: state.user_tasks.len(),
            active_tasks: state.user_tasks.values().map(HashSet::len).sum(),
            running_tasks: state
                .records
                .values()
                .filter(|record| record.status == TaskStatus::Running)
                .count(),
        }
    }

    /// Close every semaphore. Pending and future admissions fail with
    /// [`AdmissionError::Closed`]; tasks already admitted keep their permits
    /// until released.
    pub async fn close(&self) {
        self.global.close();
        self.api.close();
        let state = self.state.lock().await;
        for semaphore in state.user_semaphores.values() {
            semaphore.close();
        }
        tracing::info!("concurrency manager closed");
    }

    #[cfg(test)]
    pub(super) fn global_semaphore(&self) -> &Semaphore {
        &self.global
    }

    #[cfg(test)]
    pub(super) fn api_semaphore(&self) -> &Semaphore {
        &self.api
    }
}
