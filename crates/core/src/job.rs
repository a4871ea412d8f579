//! Job data model shared by the manager, the executor and the tracker.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job, using the control plane's wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for compute resources; lives in the pending queue.
    Queued,
    /// Directory setup and pre-validation.
    Preparing,
    /// Downloading the application program and input resources.
    FetchingResources,
    /// Main subprocess execution.
    Running,
    /// Execution suspended on server request.
    Paused,
    /// Post-processing and log collection.
    CleaningUp,
    /// Sending result resources to the control plane.
    UploadingResults,
    /// Nominal completion of the pipeline.
    Succeeded,
    /// Generic failure, including a non-zero exit of the primary command.
    Failed,
    /// Failure while acquiring required resources.
    FailedResource,
    /// Terminated on server request.
    FailedTerminated,
    /// Exceeded the allocated run time.
    FailedTimeout,
    /// An unexpected error escaped the execution pipeline.
    FailedException,
}

/// Coarse activity grouping of a [`JobStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityPhase {
    Pending,
    Active,
    Complete,
}

impl JobStatus {
    /// The activity phase this status belongs to. Total and fixed.
    pub fn phase(self) -> ActivityPhase {
        match self {
            JobStatus::Queued => ActivityPhase::Pending,

            JobStatus::Preparing
            | JobStatus::FetchingResources
            | JobStatus::Running
            | JobStatus::Paused
            | JobStatus::CleaningUp
            | JobStatus::UploadingResults => ActivityPhase::Active,

            JobStatus::Succeeded
            | JobStatus::Failed
            | JobStatus::FailedResource
            | JobStatus::FailedTerminated
            | JobStatus::FailedTimeout
            | JobStatus::FailedException => ActivityPhase::Complete,
        }
    }

    /// Whether this status is one of the terminal completion states.
    pub fn is_terminal(self) -> bool {
        self.phase() == ActivityPhase::Complete
    }
}

/// A unit of work issued by the control plane.
///
/// Identity fields never change after the record is received; `status`,
/// `working_directory` and `exit_code` are maintained by the runner as the
/// job moves through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub application_id: Uuid,
    /// Scheduling priority; smaller values run first.
    pub priority: u32,
    /// Executable the job runs, resolved on the worker machine.
    pub executable: String,
    #[serde(default)]
    pub command_line_args: Vec<String>,
    /// Input resources to download before launch.
    #[serde(default)]
    pub resource_ids: Vec<Uuid>,
    pub status: JobStatus,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl JobRecord {
    pub fn phase(&self) -> ActivityPhase {
        self.status.phase()
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
