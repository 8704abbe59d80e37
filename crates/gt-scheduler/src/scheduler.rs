//! The scheduler contract and the construction switch over backends.

use std::sync::Arc;

use async_trait::async_trait;
use gt_exec::{ContainerSandbox, InputTemplater, PostProcessor, Transport};
use gt_types::{GtResult, Job, JobRegistry, JobStatus, ProcessHandle, SchedulerConfig, SchedulerKind};
use tracing::{debug, info};

use crate::batch::BatchScheduler;
use crate::direct::DirectScheduler;
use crate::driver::{Driver, DriverContext};
use crate::task_service::TaskServiceScheduler;

/// What an execution backend reports about a submitted job, before it is
/// folded into the four-state job status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendJobState {
    /// Queued, held, or otherwise waiting to start.
    Waiting,
    /// Actively executing (including backend wind-down phases).
    Running,
    /// Finished according to the backend; the output check decides success.
    Finished,
    /// The backend no longer knows the job; treated like finished.
    Gone,
    /// The backend itself reports the job as failed.
    Failed(String),
}

/// Uniform submission and monitoring contract over the execution backends.
///
/// Lifecycle per job: `submit` moves a fresh job to Submitted and returns
/// the backend handle; repeated `check_job_completion` calls move it through
/// Running into Complete or Failed. Terminal states stick. `pre_run` /
/// `post_run` bracket a whole experiment.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Launch the job's external process (or re-attach under restart) and
    /// return its backend handle. On failure the job keeps its last good
    /// status.
    async fn submit(&self, job_id: u64, batch: u32) -> GtResult<ProcessHandle>;

    /// Inspect the backend and fold its answer into the job status.
    /// Idempotent: with no backend change, repeated calls agree.
    async fn check_job_completion(&self, job: &Job) -> GtResult<JobStatus>;

    /// Whether the backend still reports the handle as executing.
    async fn alive(&self, handle: &ProcessHandle) -> GtResult<bool>;

    /// Prepare the experiment: build container images, open port forwards.
    async fn pre_run(&self) -> GtResult<()>;

    /// Release experiment-wide resources held since `pre_run`.
    async fn post_run(&self) -> GtResult<()>;
}

/// Construct the scheduler selected by `config.kind`.
///
/// Validates the configuration first, so a batch config without cluster
/// options (and friends) fails here rather than at first submit.
pub fn create_scheduler(
    mut config: SchedulerConfig,
    registry: Arc<dyn JobRegistry>,
    templater: Arc<dyn InputTemplater>,
    post_processor: Arc<dyn PostProcessor>,
) -> GtResult<Box<dyn Scheduler>> {
    config.validate()?;

    let transport = match &config.remote {
        Some(remote) => Transport::remote(remote.clone()),
        None => Transport::local(),
    };
    let sandbox = config.container.clone().map(ContainerSandbox::new);
    let context = DriverContext {
        config: Arc::new(config),
        registry,
        transport,
        templater,
        post_processor,
        sandbox,
    };

    info!(
        kind = context.config.kind.as_str(),
        experiment = %context.config.experiment_name,
        remote = context.config.is_remote(),
        "creating scheduler"
    );
    let scheduler: Box<dyn Scheduler> = match context.config.kind {
        SchedulerKind::Direct => Box::new(DirectScheduler::new(context)),
        SchedulerKind::Batch => Box::new(BatchScheduler::new(context)),
        SchedulerKind::TaskService => Box::new(TaskServiceScheduler::new(context)),
    };
    Ok(scheduler)
}

/// Status answer that needs no backend probe: terminal states stick, and a
/// job that was never submitted has nothing to poll.
pub(crate) fn early_status(job: &Job) -> Option<JobStatus> {
    if job.status.is_terminal() || job.status == JobStatus::New {
        return Some(job.status);
    }
    None
}

/// Fold a backend probe into the job status, updating the registry.
pub(crate) async fn resolve_backend_state(
    context: &DriverContext,
    job: &Job,
    state: BackendJobState,
) -> GtResult<JobStatus> {
    match state {
        BackendJobState::Waiting => Ok(JobStatus::Submitted),
        BackendJobState::Running => {
            context
                .registry
                .update_status(job.id, job.batch, JobStatus::Running)
                .await?;
            Ok(JobStatus::Running)
        }
        BackendJobState::Finished | BackendJobState::Gone => {
            let driver = Driver::new(context.clone(), job.id, job.batch);
            driver.post_job_run().await
        }
        BackendJobState::Failed(reason) => {
            context.registry.fail_job(job.id, job.batch, reason).await?;
            Ok(JobStatus::Failed)
        }
    }
}

/// The restart path shared by every backend: never launch a second process
/// for a job whose recorded handle is still executing; otherwise move a
/// Failed job back to Submitted and re-harvest its output.
pub(crate) async fn harvest_restart(
    context: &DriverContext,
    job: &Job,
    still_alive: bool,
) -> GtResult<ProcessHandle> {
    if still_alive {
        info!(
            job_id = job.id,
            batch = job.batch,
            handle = %job.handle,
            "restart: recorded process still alive, re-attaching"
        );
        return Ok(job.handle.clone());
    }

    debug!(
        job_id = job.id,
        batch = job.batch,
        status = %job.status,
        "restart: re-harvesting finished job"
    );
    if job.status == JobStatus::Failed {
        context
            .registry
            .record_handle(job.id, job.batch, ProcessHandle::None)
            .await?;
    }
    let driver = Driver::new(context.clone(), job.id, job.batch);
    driver.post_job_run().await?;
    Ok(ProcessHandle::None)
}

/// Experiment-wide preparation shared by the backends.
pub(crate) async fn prepare_environment(context: &DriverContext) -> GtResult<()> {
    std::fs::create_dir_all(&context.config.experiment_dir)?;
    if let Some(sandbox) = &context.sandbox {
        sandbox.ensure_image_available(&context.transport).await?;
    }
    if let Some(remote) = &context.config.remote {
        if let Some(forward) = remote.port_forward {
            context.transport.open_port_forward(forward).await?;
        }
    }
    Ok(())
}

/// Counterpart of [`prepare_environment`].
pub(crate) async fn release_environment(context: &DriverContext) -> GtResult<()> {
    if let Some(remote) = &context.config.remote {
        if let Some(forward) = remote.port_forward {
            context.transport.close_port_forward(forward).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use gt_exec::{CsvColumnReader, PlaceholderTemplater};
    use gt_types::{DriverConfig, GtError, ParameterSet, ParameterValue};
    use std::path::Path;

    fn test_context(dir: &Path) -> (DriverContext, Arc<InMemoryRegistry>) {
        let template = dir.join("sim.tmpl");
        std::fs::write(&template, "{{ x }}\n").unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let config = SchedulerConfig::new(
            SchedulerKind::Direct,
            "beam",
            dir,
            DriverConfig::new("cp", &template),
        );
        let context = DriverContext {
            config: Arc::new(config),
            registry: registry.clone(),
            transport: Transport::local(),
            templater: Arc::new(PlaceholderTemplater::new()),
            post_processor: Arc::new(CsvColumnReader::new()),
            sandbox: None,
        };
        (context, registry)
    }

    fn job_with_x(id: u64, batch: u32, x: f64) -> Job {
        let mut parameters = ParameterSet::new();
        parameters.insert("x".into(), ParameterValue::Float(x));
        Job::new(id, batch, parameters)
    }

    fn collaborators(
        dir: &Path,
    ) -> (
        Arc<InMemoryRegistry>,
        Arc<PlaceholderTemplater>,
        Arc<CsvColumnReader>,
        DriverConfig,
    ) {
        let template = dir.join("sim.tmpl");
        std::fs::write(&template, "{{ x }}\n").unwrap();
        (
            Arc::new(InMemoryRegistry::new()),
            Arc::new(PlaceholderTemplater::new()),
            Arc::new(CsvColumnReader::new()),
            DriverConfig::new("cp", template),
        )
    }

    #[test]
    fn factory_rejects_batch_config_without_cluster_options() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, templater, post, driver) = collaborators(dir.path());
        let config = SchedulerConfig::new(SchedulerKind::Batch, "beam", dir.path(), driver);

        match create_scheduler(config, registry, templater, post) {
            Ok(_) => panic!("expected the factory to reject the configuration"),
            Err(GtError::Config(message)) => assert!(message.contains("cluster")),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn factory_builds_a_direct_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, templater, post, driver) = collaborators(dir.path());
        let config = SchedulerConfig::new(SchedulerKind::Direct, "beam", dir.path(), driver);

        assert!(create_scheduler(config, registry, templater, post).is_ok());
    }

    #[test]
    fn early_status_short_circuits_unpollable_jobs() {
        let mut job = job_with_x(1, 1, 0.0);
        assert_eq!(early_status(&job), Some(JobStatus::New));

        job.mark_submitted(ProcessHandle::Pid(7));
        assert_eq!(early_status(&job), None);
        job.mark_running();
        assert_eq!(early_status(&job), None);

        job.mark_failed("boom".into());
        assert_eq!(early_status(&job), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn restart_with_live_process_returns_the_existing_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (context, registry) = test_context(dir.path());
        let mut job = job_with_x(9, 1, 1.0);
        job.restart = true;
        job.mark_submitted(ProcessHandle::Pid(4242));
        registry.save(job.clone()).await.unwrap();

        let handle = harvest_restart(&context, &job, true).await.unwrap();
        assert_eq!(handle, ProcessHandle::Pid(4242));
        // No status movement, no harvest.
        let stored = registry.load(9, 1).await.unwrap();
        assert_eq!(stored.status, JobStatus::Submitted);
        assert!(stored.output.is_none());
    }

    #[tokio::test]
    async fn resolve_running_state_updates_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (context, registry) = test_context(dir.path());
        let mut job = job_with_x(2, 1, 1.0);
        job.mark_submitted(ProcessHandle::Pid(7));
        registry.save(job.clone()).await.unwrap();

        let status = resolve_backend_state(&context, &job, BackendJobState::Running)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Running);
        let stored = registry.load(2, 1).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn resolve_backend_failure_records_the_reason() {
        let dir = tempfile::tempdir().unwrap();
        let (context, registry) = test_context(dir.path());
        let mut job = job_with_x(4, 1, 1.0);
        job.mark_submitted(ProcessHandle::ClusterJob("5821".into()));
        registry.save(job.clone()).await.unwrap();

        let status = resolve_backend_state(
            &context,
            &job,
            BackendJobState::Failed("slurm reported NODE_FAIL".into()),
        )
        .await
        .unwrap();
        assert_eq!(status, JobStatus::Failed);
        let stored = registry.load(4, 1).await.unwrap();
        assert_eq!(stored.error.unwrap(), "slurm reported NODE_FAIL");
    }

    #[tokio::test]
    async fn resolve_finished_state_harvests_output() {
        let dir = tempfile::tempdir().unwrap();
        let (context, registry) = test_context(dir.path());
        let mut job = job_with_x(6, 1, 3.5);
        job.mark_submitted(ProcessHandle::Pid(7));
        registry.save(job.clone()).await.unwrap();

        let driver = Driver::new(context.clone(), 6, 1);
        std::fs::create_dir_all(driver.output_dir()).unwrap();
        std::fs::write(driver.output_path(), "3.5\n").unwrap();

        let status = resolve_backend_state(&context, &job, BackendJobState::Gone)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Complete);
        let stored = registry.load(6, 1).await.unwrap();
        assert_eq!(stored.output.unwrap().values, vec![3.5]);
    }
}
