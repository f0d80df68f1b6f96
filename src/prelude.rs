// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use deckgate::prelude::*;` to get started quickly.

pub use crate::admission::{AdmissionStats, ConcurrencyManager, RateLimiter, TaskStatus};
pub use crate::config::Limits;
pub use crate::error::{AdmissionError, ConfigError, DeckgateError};
pub use crate::lifecycle::{
    ArtifactSlot, Cancellable, CheckpointStore, FileCheckpointStore, JobEvent, JobPatch, JobPhase,
    JobSpec, JobState, LifecycleCoordinator, MemoryCheckpointStore, ResumeContext, UnitStatus,
    UnitUpdate,
};
pub use crate::task_id::{job_id_of, job_task_id, unit_task_id};
