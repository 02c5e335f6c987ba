//! Finite state machine for one deployment pipeline run

use serde::{Deserialize, Serialize};

use crate::errors::WorkerError;
use crate::models::deployment::DeploymentStatus;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Nothing published yet
    Starting,

    /// Build subprocess running
    Building,

    /// Build succeeded, artifacts being uploaded
    Uploading,

    /// All artifacts uploaded
    Succeeded,

    /// Build or upload failed
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }

    /// Status subscribers see for this state
    pub fn status(&self) -> DeploymentStatus {
        match self {
            PipelineState::Starting => DeploymentStatus::Pending,
            PipelineState::Building | PipelineState::Uploading => DeploymentStatus::InProgress,
            PipelineState::Succeeded => DeploymentStatus::Ready,
            PipelineState::Failed => DeploymentStatus::Fail,
        }
    }
}

/// Pipeline event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Build subprocess launched
    BuildStarted,

    /// Build exited 0 without tripping the stderr policy
    BuildSucceeded,

    /// Build could not start, exited non-zero, timed out or wrote to stderr
    BuildFailed(String),

    /// Every artifact uploaded
    UploadsCompleted,

    /// Scanning or uploading failed
    UploadFailed(String),
}

/// Pipeline FSM
///
/// Transitions are monotonic: once `Succeeded` or `Failed` is reached every
/// further event is rejected.
#[derive(Debug, Clone)]
pub struct PipelineFsm {
    state: PipelineState,
    error: Option<String>,
}

impl PipelineFsm {
    /// Create a new FSM in the starting state
    pub fn new() -> Self {
        Self {
            state: PipelineState::Starting,
            error: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Reason for reaching `Failed`
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: PipelineEvent) -> Result<PipelineState, WorkerError> {
        let new_state = match (self.state, &event) {
            (PipelineState::Starting, PipelineEvent::BuildStarted) => PipelineState::Building,

            // A build that never launched fails straight from Starting.
            (PipelineState::Starting, PipelineEvent::BuildFailed(reason))
            | (PipelineState::Building, PipelineEvent::BuildFailed(reason)) => {
                self.error = Some(reason.clone());
                PipelineState::Failed
            }
            (PipelineState::Building, PipelineEvent::BuildSucceeded) => PipelineState::Uploading,

            (PipelineState::Uploading, PipelineEvent::UploadsCompleted) => PipelineState::Succeeded,
            (PipelineState::Uploading, PipelineEvent::UploadFailed(reason)) => {
                self.error = Some(reason.clone());
                PipelineState::Failed
            }

            (state, event) => {
                return Err(WorkerError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for PipelineFsm {
    fn default() -> Self {
        Self::new()
    }
}
