// ABOUTME: Per-job state: phase, progress counters, artifact slots, and work units.
// ABOUTME: Also defines the typed patches used to mutate a job.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::JobPhase;

/// Fixed number of whole-job phases counted towards progress.
pub const PHASE_STEPS: u32 = 5;
/// Steps counted for each work unit.
pub const STEPS_PER_UNIT: u32 = 5;

/// Status of one work unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl UnitStatus {
    /// Completed, error and cancelled units carry an end time.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Whether a unit in this status still has to be generated.
    ///
    /// An in-progress unit has not produced its result yet, so it counts as
    /// outstanding; only completed units are done.
    pub fn needs_work(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::InProgress => write!(f, "in_progress"),
            UnitStatus::Completed => write!(f, "completed"),
            UnitStatus::Error => write!(f, "error"),
            UnitStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One independently trackable piece of a job (a slide).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub status: UnitStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Result payload produced by the unit.
    pub data: Option<Value>,
    /// Label of the step the unit is currently on.
    pub sub_step: Option<String>,
}

impl WorkUnit {
    /// Apply an update, stamping start and end times on status changes.
    fn apply(&mut self, update: UnitUpdate, now: DateTime<Utc>) {
        if update.status != self.status {
            if update.status == UnitStatus::InProgress {
                self.start_time = Some(now);
                self.end_time = None;
            } else if update.status.is_terminal() {
                self.end_time = Some(now);
            }
            self.status = update.status;
        }

        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(data) = update.data {
            self.data = Some(data);
        }
        if let Some(sub_step) = update.sub_step {
            self.sub_step = Some(sub_step);
        }
    }
}

/// Description of one unit in the job's input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub title: String,
    #[serde(default)]
    pub content: Value,
}

/// Immutable input of a generation job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub title: String,
    pub units: Vec<UnitSpec>,
}

impl JobSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            units: Vec::new(),
        }
    }

    /// Add a unit with the given title.
    pub fn unit(mut self, title: impl Into<String>) -> Self {
        self.units.push(UnitSpec {
            title: title.into(),
            content: Value::Null,
        });
        self
    }
}

/// Artifacts produced once per job and reused across pause/resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSlot {
    Theme,
    Outline,
    Images,
    Document,
}

/// State of one generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub user_id: String,
    pub state: JobPhase,
    pub spec: JobSpec,
    #[serde(default)]
    pub options: Value,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub current_step: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactSlot, Value>,
    #[serde(default)]
    pub unit_states: BTreeMap<usize, WorkUnit>,
    #[serde(default)]
    pub active_unit_ids: BTreeSet<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub resume_time: Option<DateTime<Utc>>,
    /// Seconds spent paused, accumulated over every pause/resume cycle.
    #[serde(default)]
    pub total_pause_duration: f64,
}

impl JobState {
    /// A fresh job in `Initializing` with one pending unit per spec unit.
    pub fn new(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        spec: JobSpec,
        options: Value,
    ) -> Self {
        let now = Utc::now();
        let unit_count = spec.units.len();
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            state: JobPhase::Initializing,
            total_steps: PHASE_STEPS + STEPS_PER_UNIT * unit_count as u32,
            completed_steps: 0,
            current_step: None,
            spec,
            options,
            artifacts: BTreeMap::new(),
            unit_states: (0..unit_count).map(|i| (i, WorkUnit::default())).collect(),
            active_unit_ids: BTreeSet::new(),
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            pause_time: None,
            resume_time: None,
            total_pause_duration: 0.0,
        }
    }

    /// Progress as a percentage, clamped to 100.
    pub fn progress_percent(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (f64::from(self.completed_steps) / f64::from(self.total_steps) * 100.0).min(100.0)
    }

    /// Indices of units with the given status, ascending.
    pub fn units_with(&self, predicate: impl Fn(UnitStatus) -> bool) -> Vec<usize> {
        self.unit_states
            .iter()
            .filter(|(_, unit)| predicate(unit.status))
            .map(|(index, _)| *index)
            .collect()
    }

    pub fn artifact(&self, slot: ArtifactSlot) -> Option<&Value> {
        self.artifacts.get(&slot)
    }

    /// Apply a patch. Artifact slots that are already populated are kept.
    pub fn apply(&mut self, patch: JobPatch) {
        if let Some(steps) = patch.completed_steps {
            self.completed_steps = steps;
        }
        if let Some(step) = patch.current_step {
            self.current_step = Some(step);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        for (slot, value) in patch.artifacts {
            self.artifacts.entry(slot).or_insert(value);
        }
        self.touch();
    }

    /// Apply a unit update. Returns `false` if the index is unknown.
    pub fn apply_unit(&mut self, index: usize, update: UnitUpdate) -> bool {
        let now = Utc::now();
        let Some(unit) = self.unit_states.get_mut(&index) else {
            return false;
        };
        unit.apply(update, now);
        self.updated_at = now;
        true
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A partial update to a [`JobState`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub completed_steps: Option<u32>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub artifacts: Vec<(ArtifactSlot, Value)>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed_steps(mut self, steps: u32) -> Self {
        self.completed_steps = Some(steps);
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Populate an artifact slot if it is still empty.
    pub fn artifact(mut self, slot: ArtifactSlot, value: Value) -> Self {
        self.artifacts.push((slot, value));
        self
    }
}

/// A status change for one work unit, with optional payload fields.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitUpdate {
    pub status: UnitStatus,
    pub error: Option<String>,
    pub data: Option<Value>,
    pub sub_step: Option<String>,
}

impl UnitUpdate {
    pub fn new(status: UnitStatus) -> Self {
        Self {
            status,
            error: None,
            data: None,
            sub_step: None,
        }
    }

    pub fn in_progress() -> Self {
        Self::new(UnitStatus::InProgress)
    }

    /// Mark the unit completed with its result payload.
    pub fn completed(data: Value) -> Self {
        Self::new(UnitStatus::Completed).data(data)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::new(UnitStatus::Error).error(error)
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn sub_step(mut self, sub_step: impl Into<String>) -> Self {
        self.sub_step = Some(sub_step.into());
        self
    }
}
