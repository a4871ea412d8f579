//! Error taxonomy for the engine, split by subsystem.

use std::path::PathBuf;

use fluxrun_core::job::JobStatus;
use uuid::Uuid;

use crate::rest::ApplicationType;

/// Errors from the server proxy's HTTP pipeline.
///
/// Transport and HTTP failures are retried implicitly by the next heartbeat
/// or tick; request/response callers see them through their futures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode server response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("payload file not found: {}", .0.display())]
    PayloadMissing(PathBuf),
    #[error("failed to read payload file {}: {source}", .path.display())]
    PayloadRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("response channel closed before completion")]
    ChannelClosed,
}

/// State-machine violations of the activity tracker.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("cannot hold pending job {0}; pending work lives in the backlog queue")]
    Pending(Uuid),
    #[error("unknown job {0}; cannot update status")]
    UnknownJob(Uuid),
    #[error("job {0} is tracked as both active and complete; tracker state is corrupt")]
    Corrupt(Uuid),
}

/// Misuse of the observer registry.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    #[error("an observer is already registered for message type {0:?}")]
    AlreadyRegistered(String),
    #[error("no observer registered for message type {0:?}")]
    NotRegistered(String),
}

/// Failure of a single job's execution pipeline.
///
/// The executor never propagates these to its worker; each maps onto the
/// terminal status reported to the server.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("resource acquisition failed: {0:#}")]
    Resource(anyhow::Error),
    #[error("application type {0} is not implemented")]
    NotImplemented(ApplicationType),
    #[error("terminated on server request")]
    Terminated,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// The terminal status recorded for a job that failed with this error.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            JobError::Resource(_) => JobStatus::FailedResource,
            JobError::NotImplemented(_) => JobStatus::Failed,
            JobError::Terminated => JobStatus::FailedTerminated,
            JobError::Other(_) => JobStatus::FailedException,
        }
    }
}
