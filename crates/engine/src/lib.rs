#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Runtime engine for the `fluxrun` runner: the server proxy bridging to
//! the control plane, the activity tracker, and the job scheduler.

pub mod error;
pub mod executor;
mod listener;
pub mod manager;
pub mod message;
pub mod observers;
pub mod proxy;
pub mod rest;
pub mod tracker;

pub use error::{JobError, ObserverError, ProxyError, TrackerError};
pub use executor::JobExecutor;
pub use manager::JobManager;
pub use message::{DEFAULT_PRIORITY, Message, MessageQueue};
pub use observers::{Frame, ObserverRegistry};
pub use proxy::{ResponseFuture, RunnerState, ServerProxy};
pub use rest::{
    ApplicationApi, ApplicationInfo, ApplicationType, JobApi, JobPatch, ResourceApi, ResourceInfo,
    RunnerApi, RunnerRegistration, register_runner,
};
pub use tracker::{ActivityTracker, JobCounts};
