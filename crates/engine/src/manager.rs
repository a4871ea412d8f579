//! Bounded-concurrency job scheduler: pulls pending work from a priority
//! backlog, launches each job on its own worker, and reaps completions.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ObserverError;
use crate::executor::JobExecutor;
use crate::proxy::ServerProxy;
use crate::rest::JobPatch;
use crate::tracker::ActivityTracker;
use fluxrun_core::config::JobManagerConfig;
use fluxrun_core::files::FileManager;
use fluxrun_core::job::{ActivityPhase, JobRecord, JobStatus};

const PENDING_POP_TIMEOUT: Duration = Duration::from_secs(30);
const CAPACITY_BACKOFF: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

struct PendingEntry {
    priority: u32,
    seq: u64,
    job: JobRecord,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    // Reversed so the std max-heap pops the smallest (priority, seq) pair.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Default)]
struct PendingInner {
    heap: BinaryHeap<PendingEntry>,
    seq: u64,
}

/// Priority backlog of jobs waiting for a worker slot.
#[derive(Default)]
pub(crate) struct PendingQueue {
    inner: Mutex<PendingInner>,
    wake: Notify,
}

impl PendingQueue {
    pub(crate) fn push(&self, job: JobRecord) {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(PendingEntry {
            priority: job.priority,
            seq,
            job,
        });
        drop(inner);
        self.wake.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<JobRecord> {
        self.inner.lock().heap.pop().map(|entry| entry.job)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Pop the highest-priority job, waiting up to `timeout` for one to
    /// arrive.
    pub(crate) async fn pop_timeout(&self, timeout: Duration) -> Option<JobRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.wake.notified();
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => continue,
                Err(_) => return self.try_pop(),
            }
        }
    }
}

/// Fetches the backlog at construction, then drives the main tick loop.
pub struct JobManager {
    proxy: Arc<ServerProxy>,
    files: Arc<FileManager>,
    tracker: Arc<ActivityTracker>,
    pending: Arc<PendingQueue>,
    cancellations: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    // Only the tick loop touches the worker table.
    workers: HashMap<Uuid, JoinHandle<()>>,
    config: JobManagerConfig,
    stop: CancellationToken,
    pop_timeout: Duration,
    capacity_backoff: Duration,
}

impl JobManager {
    /// Build the manager: fetch the assigned job list, seed the backlog and
    /// the tracker, and install the standing observers.
    pub async fn new(
        proxy: Arc<ServerProxy>,
        files: Arc<FileManager>,
        config: JobManagerConfig,
        stop: CancellationToken,
    ) -> Result<Self, ObserverError> {
        let manager = Self {
            proxy,
            files,
            tracker: Arc::new(ActivityTracker::default()),
            pending: Arc::new(PendingQueue::default()),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            workers: HashMap::new(),
            config,
            stop,
            pop_timeout: PENDING_POP_TIMEOUT,
            capacity_backoff: CAPACITY_BACKOFF,
        };
        manager.fetch_jobs().await;
        manager.register_observers()?;
        Ok(manager)
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    async fn fetch_jobs(&self) {
        info!("fetching assigned jobs");
        let jobs = match self.proxy.job_api().list_for_runner().await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!("failed to fetch the job list: {err:#}");
                return;
            }
        };

        let mut queued = 0usize;
        for job in jobs {
            if job.phase() == ActivityPhase::Pending {
                self.pending.push(job);
                queued += 1;
            } else if let Err(err) = self.tracker.add(&job) {
                warn!("could not track job: {err}");
            }
        }
        let counts = self.tracker.counts();
        info!(
            queued,
            active = counts.active,
            completed = counts.completed,
            "job backlog loaded"
        );
    }

    fn register_observers(&self) -> Result<(), ObserverError> {
        let observers = self.proxy.observers();

        let pending = self.pending.clone();
        observers.register("new_job_available", move |frame| {
            let Some(payload) = frame.field("job").cloned() else {
                anyhow::bail!("new_job_available frame is missing the 'job' payload");
            };
            let job: JobRecord = serde_json::from_value(payload)?;
            if job.phase() == ActivityPhase::Pending {
                info!(job_id = %job.id, "queued new job from server");
                pending.push(job);
            } else {
                warn!(job_id = %job.id, status = ?job.status, "ignoring non-pending job announcement");
            }
            Ok(None)
        })?;

        let cancellations = self.cancellations.clone();
        observers.register("terminate", move |frame| {
            let job_id = frame
                .field("job_id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("terminate frame is missing 'job_id'"))?;
            let job_id: Uuid = job_id
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid job id {job_id:?}"))?;
            match cancellations.lock().get(&job_id) {
                Some(token) => {
                    warn!(%job_id, "terminating job on server request");
                    token.cancel();
                    Ok(None)
                }
                None => Err(anyhow::anyhow!("job {job_id} is not running on this runner")),
            }
        })?;

        observers.register("pause", move |_frame| {
            warn!("pause requested but suspension is not supported");
            Err(anyhow::anyhow!("pause is not supported by this runner"))
        })?;

        Ok(())
    }

    /// Main tick loop; returns when the iteration budget is exhausted or a
    /// stop is requested, then waits for in-flight workers.
    pub async fn run(&mut self) {
        let mut loop_count: u64 = 0;
        loop {
            debug!("tick");
            if let Err(err) = self.tick().await {
                error!("tick failed: {err:#}");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }

            loop_count += 1;
            if loop_count >= self.config.max_main_loop_count {
                info!(loop_count, "reached the main loop budget, exiting");
                break;
            }
            if self.stop.is_cancelled() {
                info!("stop requested, exiting the main loop");
                break;
            }
        }
        self.drain_workers().await;
    }

    pub(crate) async fn tick(&mut self) -> anyhow::Result<()> {
        self.reap_finished();

        if self.workers.len() < self.config.max_concurrent_jobs {
            let job = tokio::select! {
                job = self.pending.pop_timeout(self.pop_timeout) => job,
                () = self.stop.cancelled() => return Ok(()),
            };
            match job {
                Some(job) => self.launch_job(job).await,
                None => debug!("no pending jobs, waiting"),
            }
        } else {
            debug!(active = self.workers.len(), "at capacity");
            tokio::select! {
                () = tokio::time::sleep(self.capacity_backoff) => {}
                () = self.stop.cancelled() => {}
            }
        }
        Ok(())
    }

    fn reap_finished(&mut self) {
        let finished: Vec<Uuid> = self
            .workers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in &finished {
            debug!(%job_id, "reaping finished worker");
            self.workers.remove(job_id);
            self.cancellations.lock().remove(job_id);
        }
        if !finished.is_empty() {
            info!("reaped {} finished job worker(s)", finished.len());
        }
    }

    async fn launch_job(&mut self, job: JobRecord) {
        info!(job_id = %job.id, priority = job.priority, "launching job");
        match self.try_launch(&job) {
            Ok(handle) => {
                self.workers.insert(job.id, handle);
            }
            Err(err) => {
                error!(job_id = %job.id, "failed to launch job: {err:#}");
                self.rollback_launch(job).await;
            }
        }
    }

    fn try_launch(&self, job: &JobRecord) -> anyhow::Result<JoinHandle<()>> {
        if job.executable.trim().is_empty() {
            anyhow::bail!("job {} has no executable", job.id);
        }

        let token = CancellationToken::new();
        let executor = JobExecutor::new(
            job.clone(),
            self.proxy.clone(),
            self.files.clone(),
            self.tracker.clone(),
            token.clone(),
        );
        self.cancellations.lock().insert(job.id, token);

        let cancellations = self.cancellations.clone();
        let job_id = job.id;
        Ok(tokio::spawn(async move {
            executor.launch().await;
            cancellations.lock().remove(&job_id);
        }))
    }

    /// The server must not believe a job is running when it is not: put the
    /// record back to QUEUED remotely, requeue it locally at its original
    /// priority, and undo any tracker entry.
    async fn rollback_launch(&mut self, mut job: JobRecord) {
        self.workers.remove(&job.id);
        self.cancellations.lock().remove(&job.id);

        match self
            .proxy
            .job_api()
            .update(job.id, &JobPatch::status(JobStatus::Queued))
            .await
        {
            Ok(_) => {
                job.status = JobStatus::Queued;
                if self.tracker.is_tracked(job.id) {
                    self.tracker.remove(job.id);
                }
                self.pending.push(job);
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    "failed to reset job after launch failure: {err:#}; \
                     operator intervention may be required"
                );
            }
        }
    }

    async fn drain_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!("waiting for {} in-flight job worker(s)", self.workers.len());
        for (job_id, handle) in self.workers.drain() {
            if let Err(err) = handle.await {
                warn!(%job_id, "job worker ended abnormally: {err}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn set_pacing(&mut self, pop_timeout: Duration, capacity_backoff: Duration) {
        self.pop_timeout = pop_timeout;
        self.capacity_backoff = capacity_backoff;
    }

    #[cfg(test)]
    pub(crate) fn pending_queue(&self) -> &Arc<PendingQueue> {
        &self.pending
    }

    #[cfg(test)]
    pub(crate) fn cancellation_for(&self, job_id: Uuid) -> Option<CancellationToken> {
        self.cancellations.lock().get(&job_id).cloned()
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
