// ABOUTME: Job lifecycle module - per-job state, pause/resume, and checkpoints.
// ABOUTME: Provides the state machine, cancellable handles, stores, and the coordinator.

mod cancel;
mod coordinator;
mod job;
mod state;
mod store;

pub use cancel::Cancellable;
pub use coordinator::{LifecycleCoordinator, ResumeContext};
pub use job::{
    ArtifactSlot, JobPatch, JobSpec, JobState, PHASE_STEPS, STEPS_PER_UNIT, UnitSpec,
    UnitStatus, UnitUpdate, WorkUnit,
};
pub use state::{JobEvent, JobPhase, JobStateMachine, StateError};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
