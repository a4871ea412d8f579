//! Per-job lifecycle execution: preparation, resource staging, subprocess
//! launch, log capture and result upload.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::message::Message;
use crate::proxy::ServerProxy;
use crate::rest::{ApplicationInfo, ApplicationType, JobPatch};
use crate::tracker::ActivityTracker;
use fluxrun_core::files::FileManager;
use fluxrun_core::job::{JobRecord, JobStatus};

/// Drives one job from QUEUED to a terminal status.
///
/// The executor exclusively owns the job's working directory, subprocess
/// handle and log files. It reports every transition to the server and the
/// activity tracker, and it never raises to the worker that runs it.
pub struct JobExecutor {
    record: JobRecord,
    proxy: Arc<ServerProxy>,
    files: Arc<FileManager>,
    tracker: Arc<ActivityTracker>,
    cancel: CancellationToken,
    application: Option<ApplicationInfo>,
}

impl JobExecutor {
    pub fn new(
        record: JobRecord,
        proxy: Arc<ServerProxy>,
        files: Arc<FileManager>,
        tracker: Arc<ActivityTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            record,
            proxy,
            files,
            tracker,
            cancel,
            application: None,
        }
    }

    /// Run the job to completion. Every failure is caught here and mapped
    /// onto a terminal FAILED_* status.
    pub async fn launch(mut self) {
        info!(job_id = %self.record.id, "starting job execution");
        match self.execute().await {
            Ok(exit_code) => {
                info!(job_id = %self.record.id, exit_code, "job finished");
            }
            Err(err) => {
                error!(job_id = %self.record.id, "job failed: {err:#}");
                self.set_status(err.terminal_status());
            }
        }
    }

    async fn execute(&mut self) -> Result<i32, JobError> {
        self.prepare().await?;
        self.fetch_resources().await?;
        let exit_code = self.run().await?;
        self.clean_up(exit_code).await?;
        Ok(exit_code)
    }

    /// Single sink for status transitions: mutates the local record,
    /// notifies the server through the outbound queue, and keeps the
    /// activity tracker in step. Failures are logged, never raised.
    fn set_status(&mut self, status: JobStatus) {
        debug!(job_id = %self.record.id, ?status, "status transition");
        self.record.status = status;

        let message = self.patch_message(&JobPatch::status(status));
        self.proxy.push_message(message);

        let result = if self.tracker.is_tracked(self.record.id) {
            self.tracker.update_status(self.record.id, status)
        } else {
            self.tracker.add(&self.record)
        };
        if let Err(err) = result {
            warn!(job_id = %self.record.id, "tracker rejected status change: {err}");
        }
    }

    fn job_endpoint(&self) -> String {
        format!("job_manager/job/{}", self.record.id)
    }

    fn patch_message(&self, patch: &JobPatch) -> Message {
        // A JobPatch is a plain field struct; serialization cannot fail.
        let body = serde_json::to_value(patch).unwrap_or(Value::Null);
        Message::json(self.job_endpoint(), Method::PATCH, Some(body))
    }

    fn working_dir(&self) -> Result<PathBuf, JobError> {
        self.record
            .working_directory
            .clone()
            .ok_or_else(|| JobError::Other(anyhow::anyhow!("working directory not prepared")))
    }

    async fn prepare(&mut self) -> Result<(), JobError> {
        self.set_status(JobStatus::Preparing);

        let application = self
            .proxy
            .application_api()
            .retrieve(self.record.application_id)
            .await
            .map_err(|err| resource_err(err, "fetch application metadata"))?;
        debug!(job_id = %self.record.id, application = %application.name, "application resolved");
        self.application = Some(application);

        let case_dir = self
            .files
            .request_simulation_directory(&self.record.id.to_string())
            .map_err(|err| {
                JobError::Other(anyhow::Error::new(err).context("create working directory"))
            })?;
        self.record.working_directory = Some(case_dir.clone());

        self.proxy
            .push_with_response(self.patch_message(&JobPatch::working_directory(case_dir)))
            .wait()
            .await
            .map_err(|err| {
                JobError::Other(anyhow::Error::new(err).context("report working directory"))
            })?;
        Ok(())
    }

    async fn fetch_resources(&mut self) -> Result<(), JobError> {
        self.set_status(JobStatus::FetchingResources);
        let dir = self.working_dir()?;

        let Some(application) = self.application.clone() else {
            return Err(JobError::Other(anyhow::anyhow!(
                "application metadata missing after prepare"
            )));
        };
        let program_name = match application.application_type {
            ApplicationType::Python => format!("{}.py", application.name),
            other => return Err(JobError::NotImplemented(other)),
        };

        let program = self
            .proxy
            .application_api()
            .program(application.id)
            .await
            .map_err(|err| resource_err(err, "download application program"))?;
        write_binary(&dir.join(&program_name), &program).await?;
        debug!(job_id = %self.record.id, program = %program_name, "program staged");

        let resources = self.proxy.resource_api();
        for resource_id in &self.record.resource_ids {
            let info = resources
                .retrieve(*resource_id)
                .await
                .map_err(|err| resource_err(err, "fetch resource metadata"))?;
            let payload = resources
                .download(*resource_id)
                .await
                .map_err(|err| resource_err(err, "download resource payload"))?;
            write_binary(&dir.join(&info.filename), &payload).await?;
            debug!(job_id = %self.record.id, resource = %info.filename, "resource staged");
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<i32, JobError> {
        self.set_status(JobStatus::Running);
        let dir = self.working_dir()?;

        let stdout = create_log_file(&dir.join(format!("{}_out.log", self.record.id)))?;
        let stderr = create_log_file(&dir.join(format!("{}_err.log", self.record.id)))?;

        info!(
            job_id = %self.record.id,
            command = %self.record.executable,
            args = ?self.record.command_line_args,
            "launching subprocess"
        );
        let mut child = tokio::process::Command::new(&self.record.executable)
            .args(&self.record.command_line_args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| {
                JobError::Other(
                    anyhow::Error::new(err).context(format!("spawn {}", self.record.executable)),
                )
            })?;

        let status = tokio::select! {
            status = child.wait() => status.map_err(|err| {
                JobError::Other(anyhow::Error::new(err).context("wait for subprocess"))
            })?,
            () = self.cancel.cancelled() => {
                warn!(job_id = %self.record.id, "terminate requested; killing subprocess");
                if let Err(err) = child.kill().await {
                    warn!(job_id = %self.record.id, "failed to kill subprocess: {err}");
                }
                return Err(JobError::Terminated);
            }
        };

        // Death by signal carries no exit code; report it as -1.
        let exit_code = status.code().unwrap_or(-1);
        self.record.exit_code = Some(exit_code);
        Ok(exit_code)
    }

    async fn clean_up(&mut self, exit_code: i32) -> Result<(), JobError> {
        self.set_status(JobStatus::CleaningUp);
        let dir = self.working_dir()?;

        for (stream, description) in [
            ("out", "captured standard output"),
            ("err", "captured standard error"),
        ] {
            let filename = format!("{}_{stream}.log", self.record.id);
            let upload = Message::file_upload(
                "job_manager/resource",
                Method::POST,
                dir.join(&filename),
            )
            .with_param("job_id", self.record.id.to_string())
            .with_param("resource_type", "LOG")
            .with_param("filename", filename)
            .with_param("description", description);
            self.proxy.push_message(upload);
        }

        self.set_status(JobStatus::UploadingResults);

        self.proxy
            .push_with_response(self.patch_message(&JobPatch::exit_code(exit_code)))
            .wait()
            .await
            .map_err(|err| JobError::Other(anyhow::Error::new(err).context("report exit code")))?;

        self.set_status(if exit_code == 0 {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        });
        Ok(())
    }
}

fn resource_err(err: crate::error::ProxyError, context: &'static str) -> JobError {
    JobError::Resource(anyhow::Error::new(err).context(context))
}

async fn write_binary(path: &Path, bytes: &[u8]) -> Result<(), JobError> {
    tokio::fs::write(path, bytes).await.map_err(|err| {
        JobError::Resource(
            anyhow::Error::new(err).context(format!("write {}", path.display())),
        )
    })
}

fn create_log_file(path: &Path) -> Result<std::fs::File, JobError> {
    std::fs::File::create(path).map_err(|err| {
        JobError::Other(anyhow::Error::new(err).context(format!("create {}", path.display())))
    })
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
