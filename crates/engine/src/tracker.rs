//! Thread-safe index of jobs by activity phase.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::TrackerError;
use fluxrun_core::job::{ActivityPhase, JobRecord, JobStatus};

/// Snapshot of tracker occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCounts {
    pub active: usize,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: HashMap<Uuid, JobRecord>,
    completed: HashMap<Uuid, JobRecord>,
}

/// Two disjoint maps of jobs, one per non-pending activity phase.
///
/// Pending work lives in the manager's backlog queue, never here. A job id
/// is in at most one map at any time; `update_status` relocates records
/// when a status change crosses the phase boundary.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    inner: Mutex<TrackerInner>,
}

impl ActivityTracker {
    /// Place a job in the map dictated by its status phase.
    pub fn add(&self, job: &JobRecord) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        match job.phase() {
            ActivityPhase::Pending => Err(TrackerError::Pending(job.id)),
            ActivityPhase::Active => {
                inner.active.insert(job.id, job.clone());
                Ok(())
            }
            ActivityPhase::Complete => {
                inner.completed.insert(job.id, job.clone());
                Ok(())
            }
        }
    }

    /// Update a job's status, relocating it between maps if its phase
    /// changed.
    pub fn update_status(&self, job_id: Uuid, new_status: JobStatus) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        let is_active = inner.active.contains_key(&job_id);
        let is_completed = inner.completed.contains_key(&job_id);

        if is_active && is_completed {
            return Err(TrackerError::Corrupt(job_id));
        }
        if !is_active && !is_completed {
            return Err(TrackerError::UnknownJob(job_id));
        }

        match new_status.phase() {
            ActivityPhase::Pending => Err(TrackerError::Pending(job_id)),
            ActivityPhase::Active => {
                if is_active {
                    if let Some(job) = inner.active.get_mut(&job_id) {
                        job.status = new_status;
                    }
                } else if let Some(mut job) = inner.completed.remove(&job_id) {
                    job.status = new_status;
                    inner.active.insert(job_id, job);
                }
                Ok(())
            }
            ActivityPhase::Complete => {
                if is_completed {
                    if let Some(job) = inner.completed.get_mut(&job_id) {
                        job.status = new_status;
                    }
                } else if let Some(mut job) = inner.active.remove(&job_id) {
                    job.status = new_status;
                    inner.completed.insert(job_id, job);
                }
                Ok(())
            }
        }
    }

    /// Delete a job from whichever map holds it; returns whether anything
    /// was removed.
    pub fn remove(&self, job_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        let from_active = inner.active.remove(&job_id).is_some();
        let from_completed = inner.completed.remove(&job_id).is_some();
        from_active || from_completed
    }

    pub fn is_active(&self, job_id: Uuid) -> bool {
        self.inner.lock().active.contains_key(&job_id)
    }

    pub fn is_completed(&self, job_id: Uuid) -> bool {
        self.inner.lock().completed.contains_key(&job_id)
    }

    pub fn is_tracked(&self, job_id: Uuid) -> bool {
        let inner = self.inner.lock();
        inner.active.contains_key(&job_id) || inner.completed.contains_key(&job_id)
    }

    /// Current status of a tracked job, if any.
    pub fn job_status(&self, job_id: Uuid) -> Option<JobStatus> {
        let inner = self.inner.lock();
        inner
            .active
            .get(&job_id)
            .or_else(|| inner.completed.get(&job_id))
            .map(|job| job.status)
    }

    pub fn active_job_ids(&self) -> Vec<Uuid> {
        self.inner.lock().active.keys().copied().collect()
    }

    pub fn active_jobs(&self) -> Vec<JobRecord> {
        self.inner.lock().active.values().cloned().collect()
    }

    pub fn completed_jobs(&self) -> Vec<JobRecord> {
        self.inner.lock().completed.values().cloned().collect()
    }

    pub fn counts(&self) -> JobCounts {
        let inner = self.inner.lock();
        JobCounts {
            active: inner.active.len(),
            completed: inner.completed.len(),
            total: inner.active.len() + inner.completed.len(),
        }
    }
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
