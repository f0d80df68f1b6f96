// ABOUTME: Job lifecycle state machine: phases, the events that move between them,
// ABOUTME: and the pure transition function the coordinator applies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during phase transitions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("Invalid transition: cannot apply {event} in phase {from}")]
    InvalidTransition { from: JobPhase, event: JobEvent },

    #[error("Terminal state: {0} is a terminal state and cannot transition")]
    TerminalState(JobPhase),
}

/// Overall phase of one generation job.
///
/// ```text
/// Initializing → PrepDone → MediaReady → UnitsInProgress → Finalizing → Completed
///                              │  ▲            │  ▲
///                              ▼  │            ▼  │
///                              Paused ─────────┘
/// any non-terminal → Error | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    Initializing,
    PrepDone,
    MediaReady,
    UnitsInProgress,
    Paused,
    Finalizing,
    Completed,
    Error,
    Cancelled,
}

impl JobPhase {
    /// Check if this is a terminal phase
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Whether `pause` is accepted from this phase.
    pub fn is_pausable(&self) -> bool {
        matches!(self, Self::UnitsInProgress | Self::MediaReady)
    }

    /// Get all valid next phases from this phase
    pub fn valid_transitions(&self) -> &'static [JobPhase] {
        match self {
            Self::Initializing => &[Self::PrepDone, Self::Error, Self::Cancelled],
            Self::PrepDone => &[Self::MediaReady, Self::Error, Self::Cancelled],
            Self::MediaReady => &[
                Self::UnitsInProgress,
                Self::Paused,
                Self::Error,
                Self::Cancelled,
            ],
            Self::UnitsInProgress => &[
                Self::Finalizing,
                Self::Paused,
                Self::Error,
                Self::Cancelled,
            ],
            Self::Paused => &[Self::UnitsInProgress, Self::Error, Self::Cancelled],
            Self::Finalizing => &[Self::Completed, Self::Error, Self::Cancelled],
            Self::Completed | Self::Error | Self::Cancelled => &[],
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::PrepDone => "PREP_DONE",
            Self::MediaReady => "MEDIA_READY",
            Self::UnitsInProgress => "UNITS_IN_PROGRESS",
            Self::Paused => "PAUSED",
            Self::Finalizing => "FINALIZING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// Input preparation (outline, prompts) is done
    PrepFinished,
    /// Shared media (theme, images) is available
    MediaFinished,
    /// Work units have started
    UnitsStarted,
    Pause,
    Resume,
    /// Every unit is done and the document is being assembled
    Finalize,
    Complete,
    Fail,
    Cancel,
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PrepFinished => "prep_finished",
            Self::MediaFinished => "media_finished",
            Self::UnitsStarted => "units_started",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Finalize => "finalize",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Job lifecycle state machine
pub struct JobStateMachine;

impl JobStateMachine {
    /// Attempt a phase transition
    ///
    /// Returns the new phase if the transition is valid, or an error otherwise.
    pub fn transition(current: JobPhase, event: JobEvent) -> Result<JobPhase, StateError> {
        if current.is_terminal() {
            return Err(StateError::TerminalState(current));
        }

        let next = match (current, event) {
            (_, JobEvent::Fail) => JobPhase::Error,
            (_, JobEvent::Cancel) => JobPhase::Cancelled,

            (JobPhase::Initializing, JobEvent::PrepFinished) => JobPhase::PrepDone,
            (JobPhase::PrepDone, JobEvent::MediaFinished) => JobPhase::MediaReady,
            (JobPhase::MediaReady, JobEvent::UnitsStarted) => JobPhase::UnitsInProgress,
            (JobPhase::UnitsInProgress, JobEvent::Finalize) => JobPhase::Finalizing,
            (JobPhase::Finalizing, JobEvent::Complete) => JobPhase::Completed,

            (JobPhase::MediaReady | JobPhase::UnitsInProgress, JobEvent::Pause) => JobPhase::Paused,
            (JobPhase::Paused, JobEvent::Resume) => JobPhase::UnitsInProgress,

            _ => {
                return Err(StateError::InvalidTransition {
                    from: current,
                    event,
                });
            }
        };

        Ok(next)
    }

    /// Check if a transition is valid without performing it
    pub fn can_transition(current: JobPhase, event: JobEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
