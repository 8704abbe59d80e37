//! Driver — turns one job record into a concrete external process run.
//!
//! A driver is constructed per `(job_id, batch)` pair. It owns the layout of
//! the per-job directory, stages the rendered input file, launches the
//! command through the transport, and harvests the output once the process
//! is done. Status transitions flow through the registry only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gt_exec::{ContainerSandbox, CopyDirection, InputTemplater, PostProcessor, Transport};
use gt_types::{
    GtResult, Job, JobOutput, JobRegistry, JobStatus, ProcessHandle, SchedulerConfig,
    SubmissionError,
};
use tracing::{debug, info, warn};

/// Pause between attempts when staging commands are retried.
const STAGING_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Collaborators shared by every driver a scheduler creates.
#[derive(Clone)]
pub struct DriverContext {
    pub config: Arc<SchedulerConfig>,
    pub registry: Arc<dyn JobRegistry>,
    pub transport: Transport,
    pub templater: Arc<dyn InputTemplater>,
    pub post_processor: Arc<dyn PostProcessor>,
    pub sandbox: Option<ContainerSandbox>,
}

/// Stages, launches, and harvests a single job.
pub struct Driver {
    context: DriverContext,
    job_id: u64,
    batch: u32,
}

impl Driver {
    pub fn new(context: DriverContext, job_id: u64, batch: u32) -> Self {
        Self {
            context,
            job_id,
            batch,
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    fn file_stem(&self) -> String {
        format!("{}_{}", self.context.config.experiment_name, self.job_id)
    }

    /// Per-job working directory under the experiment directory.
    pub fn job_dir(&self) -> PathBuf {
        self.context
            .config
            .experiment_dir
            .join(self.job_id.to_string())
    }

    /// Rendered input file handed to the simulation.
    pub fn input_path(&self) -> PathBuf {
        self.job_dir().join(format!("{}.input", self.file_stem()))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.job_dir().join("output")
    }

    /// Raw output file the simulation is expected to write.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir().join(format!("{}.csv", self.file_stem()))
    }

    /// Combined stdout/stderr of the launched process.
    pub fn log_path(&self) -> PathBuf {
        self.job_dir().join(format!("{}.log", self.file_stem()))
    }

    /// Submission script location (batch backends).
    pub fn script_path(&self) -> PathBuf {
        self.job_dir().join(format!("{}.sh", self.file_stem()))
    }

    /// The plain launch command: executable, configured args, then the
    /// input and output paths as the final two arguments.
    pub fn command_line(&self) -> String {
        let driver = &self.context.config.driver;
        let mut parts = Vec::with_capacity(driver.args.len() + 3);
        parts.push(driver.executable.clone());
        parts.extend(driver.args.iter().cloned());
        parts.push(self.input_path().display().to_string());
        parts.push(self.output_path().display().to_string());
        parts.join(" ")
    }

    /// The command actually launched: [`Driver::command_line`] wrapped for
    /// the container sandbox when one is configured.
    pub fn launch_command(&self) -> String {
        let raw = self.command_line();
        match &self.context.sandbox {
            Some(sandbox) => sandbox.wrap_command(&raw),
            None => raw,
        }
    }

    /// Prepare the job for launch: create the per-job directories, render
    /// the input file from the job's parameters, and push it to the remote
    /// host when one is configured. Only fresh jobs may be staged; restarts
    /// never pass through here.
    pub async fn pre_job_run(&self) -> GtResult<Job> {
        let job = self.context.registry.load(self.job_id, self.batch).await?;
        if job.status != JobStatus::New {
            return Err(SubmissionError::NotSubmittable {
                job_id: self.job_id,
                status: job.status.to_string(),
            }
            .into());
        }

        std::fs::create_dir_all(self.output_dir())?;
        self.context.templater.materialize(
            &self.context.config.driver.input_template,
            &job.parameters,
            &self.input_path(),
        )?;

        if self.context.config.is_remote() {
            let transport = &self.context.transport;
            transport
                .run_with_retries(
                    &format!("mkdir -p {}", self.output_dir().display()),
                    self.context.config.transport_retries,
                    STAGING_RETRY_DELAY,
                )
                .await?;
            transport
                .copy(&self.input_path(), &self.input_path(), CopyDirection::Push)
                .await?;
        }

        debug!(
            job_id = self.job_id,
            batch = self.batch,
            input = %self.input_path().display(),
            "job staged"
        );
        Ok(job)
    }

    /// Stage the job and launch its process detached, recording the pid as
    /// the job's handle. The job comes out Submitted; the first completion
    /// check observes Running.
    pub async fn pre_job_run_and_run_job(&self) -> GtResult<ProcessHandle> {
        self.pre_job_run().await?;

        let command = self.launch_command();
        info!(
            job_id = self.job_id,
            batch = self.batch,
            %command,
            "launching job process"
        );
        let pid = self
            .context
            .transport
            .spawn_detached(&command, &self.log_path())
            .await
            .map_err(|err| SubmissionError::LaunchFailed {
                job_id: self.job_id,
                message: err.to_string(),
            })?;

        let handle = ProcessHandle::Pid(pid);
        self.context
            .registry
            .record_handle(self.job_id, self.batch, handle.clone())
            .await?;
        Ok(handle)
    }

    /// Harvest a finished job: pull the raw output local when remote, run
    /// the post-processor on it, and record the result. Returns the terminal
    /// status. Idempotent: a job already Complete is left untouched, so the
    /// extraction runs at most once per job.
    pub async fn post_job_run(&self) -> GtResult<JobStatus> {
        let job = self.context.registry.load(self.job_id, self.batch).await?;
        if job.status == JobStatus::Complete {
            debug!(
                job_id = self.job_id,
                batch = self.batch,
                "output already harvested"
            );
            return Ok(JobStatus::Complete);
        }

        if self.context.config.is_remote() {
            // A fetch failure falls through to the output check below, which
            // decides between Complete and Failed from what is on disk.
            if let Err(err) = self
                .context
                .transport
                .copy(&self.output_path(), &self.output_path(), CopyDirection::Pull)
                .await
            {
                warn!(
                    job_id = self.job_id,
                    batch = self.batch,
                    error = %err,
                    "could not fetch remote output"
                );
            }
        }

        match self.context.post_processor.extract(&self.output_path()) {
            Ok(values) => {
                let output = JobOutput::new(values, self.output_path());
                self.context
                    .registry
                    .complete_job(self.job_id, self.batch, output)
                    .await?;
                info!(job_id = self.job_id, batch = self.batch, "job complete");
                Ok(JobStatus::Complete)
            }
            Err(err) => {
                warn!(
                    job_id = self.job_id,
                    batch = self.batch,
                    error = %err,
                    "post-processing failed"
                );
                self.context
                    .registry
                    .fail_job(self.job_id, self.batch, err.to_string())
                    .await?;
                Ok(JobStatus::Failed)
            }
        }
    }
}
