//! Direct scheduler — runs jobs as local (or SSH-remote) OS processes.

use std::time::Duration;

use async_trait::async_trait;
use gt_types::{GtResult, Job, JobStatus, PollingError, ProcessHandle};
use tracing::debug;

use crate::driver::{Driver, DriverContext};
use crate::scheduler::{
    early_status, harvest_restart, prepare_environment, release_environment,
    resolve_backend_state, BackendJobState, Scheduler,
};

const FOREGROUND_WAIT: Duration = Duration::from_millis(250);

/// Launches the driver's command as a detached process and tracks it by pid.
///
/// With `detach = false` the submit call waits for the process to exit and
/// harvests the output inline, which makes one evaluation fully synchronous.
pub struct DirectScheduler {
    context: DriverContext,
}

impl DirectScheduler {
    pub fn new(context: DriverContext) -> Self {
        Self { context }
    }

    /// Liveness probe on the process state, not mere pid existence.
    ///
    /// Detached jobs are spawned through an intermediate shell that exits
    /// right away, so nothing ever waits on the child. Where pid 1 does not
    /// reap, the finished process lingers as a zombie (`kill -0` would still
    /// succeed on it); state `Z` must count as dead or the job stays Running
    /// until the polling budget runs out.
    async fn pid_alive(&self, pid: u32) -> GtResult<bool> {
        let output = self
            .context
            .transport
            .run(&format!("ps -o state= -p {pid}"))
            .await
            .map_err(|err| PollingError::ProbeFailed {
                message: err.to_string(),
            })?;
        if !output.success() {
            return Ok(false);
        }
        let state = output.stdout.trim();
        Ok(!state.is_empty() && !state.starts_with('Z'))
    }

    async fn wait_for_exit(&self, pid: u32) -> GtResult<()> {
        while self.pid_alive(pid).await? {
            tokio::time::sleep(FOREGROUND_WAIT).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Scheduler for DirectScheduler {
    async fn submit(&self, job_id: u64, batch: u32) -> GtResult<ProcessHandle> {
        let job = self.context.registry.load(job_id, batch).await?;
        if job.restart && job.status != JobStatus::New {
            let still_alive = self.alive(&job.handle).await?;
            return harvest_restart(&self.context, &job, still_alive).await;
        }

        let driver = Driver::new(self.context.clone(), job_id, batch);
        let handle = driver.pre_job_run_and_run_job().await?;

        if !self.context.config.detach {
            if let ProcessHandle::Pid(pid) = handle {
                debug!(job_id, batch, pid, "foreground mode: waiting for process exit");
                self.wait_for_exit(pid).await?;
                driver.post_job_run().await?;
            }
        }
        Ok(handle)
    }

    async fn check_job_completion(&self, job: &Job) -> GtResult<JobStatus> {
        if let Some(status) = early_status(job) {
            return Ok(status);
        }
        let state = match &job.handle {
            ProcessHandle::Pid(pid) => {
                if self.pid_alive(*pid).await? {
                    BackendJobState::Running
                } else {
                    BackendJobState::Gone
                }
            }
            ProcessHandle::None => BackendJobState::Gone,
            other => {
                return Err(PollingError::ForeignHandle {
                    handle: other.to_string(),
                }
                .into())
            }
        };
        resolve_backend_state(&self.context, job, state).await
    }

    async fn alive(&self, handle: &ProcessHandle) -> GtResult<bool> {
        match handle {
            ProcessHandle::Pid(pid) => self.pid_alive(*pid).await,
            ProcessHandle::None => Ok(false),
            other => Err(PollingError::ForeignHandle {
                handle: other.to_string(),
            }
            .into()),
        }
    }

    async fn pre_run(&self) -> GtResult<()> {
        prepare_environment(&self.context).await
    }

    async fn post_run(&self) -> GtResult<()> {
        release_environment(&self.context).await
    }
}
