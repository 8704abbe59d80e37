//! Batch scheduler — submits jobs to a PBS or Slurm queue and polls by id.

use async_trait::async_trait;
use gt_types::{
    config_error, ClusterFlavor, ClusterOptions, GtResult, Job, JobStatus, PollingError,
    ProcessHandle, SubmissionError,
};
use tracing::{debug, info};

use crate::driver::{Driver, DriverContext};
use crate::scheduler::{
    early_status, harvest_restart, prepare_environment, release_environment,
    resolve_backend_state, BackendJobState, Scheduler,
};

/// Pull the cluster job id out of `sbatch` stdout.
///
/// The submission line looks like `Submitted batch job 5821` (optionally
/// followed by a cluster name); warnings may precede it, so the last
/// matching line wins.
pub fn parse_slurm_job_id(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        let rest = line.trim().strip_prefix("Submitted batch job ")?;
        let id: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    })
}

/// Pull the cluster job id out of `qsub` stdout.
///
/// PBS prints the full job id, e.g. `5821.master.cluster.local`; the leading
/// numeric component is the id used for polling.
pub fn parse_pbs_job_id(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        let head = line.trim().split('.').next()?;
        if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) {
            Some(head.to_string())
        } else {
            None
        }
    })
}

/// Map a Slurm job state word onto the backend state.
///
/// `COMPLETING` is still Running: the job has not released its resources
/// and its output may not be flushed yet.
pub fn map_slurm_state(state: &str) -> Option<BackendJobState> {
    let state = state.trim().trim_end_matches('+');
    if state.is_empty() {
        return Some(BackendJobState::Gone);
    }
    if state.starts_with("CANCELLED") {
        return Some(BackendJobState::Failed(format!("slurm reported {state}")));
    }
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "SUSPENDED" => {
            Some(BackendJobState::Waiting)
        }
        "RUNNING" | "COMPLETING" => Some(BackendJobState::Running),
        "COMPLETED" => Some(BackendJobState::Finished),
        "FAILED" | "BOOT_FAIL" | "NODE_FAIL" | "OUT_OF_MEMORY" | "TIMEOUT" | "DEADLINE"
        | "PREEMPTED" => Some(BackendJobState::Failed(format!("slurm reported {state}"))),
        _ => None,
    }
}

/// Map a PBS `job_state` letter onto the backend state.
///
/// PBS does not report failure through the state letter; a vanished or
/// finished job goes through the driver's output check instead.
pub fn map_pbs_state(state: &str) -> Option<BackendJobState> {
    match state.trim() {
        "Q" | "H" | "W" | "T" | "S" => Some(BackendJobState::Waiting),
        "R" | "E" => Some(BackendJobState::Running),
        "C" | "F" => Some(BackendJobState::Finished),
        "" => Some(BackendJobState::Gone),
        _ => None,
    }
}

/// Extract the `job_state = X` value from `qstat -f` output.
pub fn parse_qstat_state(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        if key.trim() == "job_state" {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Submits rendered job scripts with `sbatch`/`qsub` and polls the queue
/// for state by cluster job id.
pub struct BatchScheduler {
    context: DriverContext,
}

impl BatchScheduler {
    pub fn new(context: DriverContext) -> Self {
        Self { context }
    }

    fn cluster(&self) -> GtResult<&ClusterOptions> {
        self.context
            .config
            .cluster
            .as_ref()
            .ok_or_else(|| config_error!("batch scheduler requires cluster options"))
    }

    /// Render the submission script for one job: resource directives for the
    /// configured flavor, then the driver's launch command.
    pub fn submission_script(&self, driver: &Driver) -> GtResult<String> {
        let cluster = self.cluster()?;
        let config = &self.context.config;
        let job_name = format!("{}_{}", config.experiment_name, driver.job_id());
        let log = driver.log_path();

        let mut script = String::from("#!/bin/bash\n");
        match cluster.flavor {
            ClusterFlavor::Slurm => {
                script.push_str(&format!("#SBATCH --job-name={job_name}\n"));
                script.push_str(&format!("#SBATCH --partition={}\n", cluster.queue));
                script.push_str(&format!("#SBATCH --time={}\n", cluster.walltime));
                script.push_str(&format!("#SBATCH --nodes={}\n", cluster.num_nodes));
                script.push_str(&format!(
                    "#SBATCH --ntasks-per-node={}\n",
                    cluster.procs_per_node
                ));
                script.push_str(&format!("#SBATCH --output={}\n", log.display()));
            }
            ClusterFlavor::Pbs => {
                script.push_str(&format!("#PBS -N {job_name}\n"));
                script.push_str(&format!("#PBS -q {}\n", cluster.queue));
                script.push_str(&format!("#PBS -l walltime={}\n", cluster.walltime));
                script.push_str(&format!(
                    "#PBS -l nodes={}:ppn={}\n",
                    cluster.num_nodes, cluster.procs_per_node
                ));
                script.push_str(&format!("#PBS -o {}\n", log.display()));
                script.push_str("#PBS -j oe\n");
            }
        }
        script.push('\n');
        script.push_str(&format!("cd {}\n", driver.job_dir().display()));
        script.push_str(&driver.launch_command());
        script.push('\n');
        Ok(script)
    }

    async fn probe_id(&self, id: &str) -> GtResult<BackendJobState> {
        match self.cluster()?.flavor {
            ClusterFlavor::Slurm => self.probe_slurm(id).await,
            ClusterFlavor::Pbs => self.probe_pbs(id).await,
        }
    }

    async fn probe_slurm(&self, id: &str) -> GtResult<BackendJobState> {
        let command = format!("squeue -h -j {id} -o %T");
        let output = self
            .context
            .transport
            .run(&command)
            .await
            .map_err(|err| PollingError::ProbeFailed {
                message: err.to_string(),
            })?;
        // squeue errors out once the job has left the queue.
        if !output.success() {
            return Ok(BackendJobState::Gone);
        }
        let state = output.stdout.trim().to_string();
        map_slurm_state(&state)
            .ok_or_else(|| PollingError::UnknownState { state }.into())
    }

    async fn probe_pbs(&self, id: &str) -> GtResult<BackendJobState> {
        let command = format!("qstat -f {id}");
        let output = self
            .context
            .transport
            .run(&command)
            .await
            .map_err(|err| PollingError::ProbeFailed {
                message: err.to_string(),
            })?;
        if !output.success() {
            return Ok(BackendJobState::Gone);
        }
        let state = parse_qstat_state(&output.stdout).unwrap_or_default();
        map_pbs_state(&state)
            .ok_or_else(|| PollingError::UnknownState { state }.into())
    }
}

#[async_trait]
impl Scheduler for BatchScheduler {
    async fn submit(&self, job_id: u64, batch: u32) -> GtResult<ProcessHandle> {
        let job = self.context.registry.load(job_id, batch).await?;
        if job.restart && job.status != JobStatus::New {
            let still_alive = self.alive(&job.handle).await?;
            return harvest_restart(&self.context, &job, still_alive).await;
        }

        let cluster = self.cluster()?;
        let driver = Driver::new(self.context.clone(), job_id, batch);
        driver.pre_job_run().await?;

        let script = self.submission_script(&driver)?;
        let script_path = driver.script_path();
        std::fs::write(&script_path, script)?;
        if self.context.config.is_remote() {
            self.context
                .transport
                .copy(&script_path, &script_path, gt_exec::CopyDirection::Push)
                .await?;
        }

        let submit_command = match cluster.flavor {
            ClusterFlavor::Slurm => format!("sbatch {}", script_path.display()),
            ClusterFlavor::Pbs => format!("qsub {}", script_path.display()),
        };
        info!(job_id, batch, command = %submit_command, "submitting batch job");
        let output = self
            .context
            .transport
            .run(&submit_command)
            .await
            .map_err(|err| SubmissionError::LaunchFailed {
                job_id,
                message: err.to_string(),
            })?;
        if !output.success() {
            return Err(SubmissionError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }

        let cluster_id = match cluster.flavor {
            ClusterFlavor::Slurm => parse_slurm_job_id(&output.stdout),
            ClusterFlavor::Pbs => parse_pbs_job_id(&output.stdout),
        }
        .ok_or_else(|| SubmissionError::UnparseableJobId {
            output: output.stdout.clone(),
        })?;

        debug!(job_id, batch, cluster_id = %cluster_id, "batch job accepted");
        let handle = ProcessHandle::ClusterJob(cluster_id);
        self.context
            .registry
            .record_handle(job_id, batch, handle.clone())
            .await?;
        Ok(handle)
    }

    async fn check_job_completion(&self, job: &Job) -> GtResult<JobStatus> {
        if let Some(status) = early_status(job) {
            return Ok(status);
        }
        let state = match &job.handle {
            ProcessHandle::ClusterJob(id) => self.probe_id(id).await?,
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
            ProcessHandle::ClusterJob(id) => {
                let state = self.probe_id(id).await?;
                Ok(matches!(
                    state,
                    BackendJobState::Waiting | BackendJobState::Running
                ))
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use gt_exec::{CsvColumnReader, PlaceholderTemplater, Transport};
    use gt_types::{
        DriverConfig, GtError, JobRegistry, ParameterSet, ParameterValue, SchedulerConfig,
        SchedulerKind,
    };
    use std::path::Path;
    use std::sync::Arc;

    fn scheduler_with_flavor(
        dir: &Path,
        flavor: ClusterFlavor,
    ) -> (BatchScheduler, Arc<InMemoryRegistry>) {
        let template = dir.join("sim.tmpl");
        std::fs::write(&template, "{{ x }}\n").unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let cluster = ClusterOptions {
            flavor,
            queue: "compute".into(),
            walltime: "02:00:00".into(),
            num_nodes: 2,
            procs_per_node: 8,
        };
        let config = SchedulerConfig::new(
            SchedulerKind::Batch,
            "bending_beam",
            dir,
            DriverConfig::new("./solver", &template),
        )
        .with_cluster(cluster);
        let context = DriverContext {
            config: Arc::new(config),
            registry: registry.clone(),
            transport: Transport::local(),
            templater: Arc::new(PlaceholderTemplater::new()),
            post_processor: Arc::new(CsvColumnReader::new()),
            sandbox: None,
        };
        (BatchScheduler::new(context), registry)
    }

    #[test]
    fn slurm_submission_stdout_parses() {
        assert_eq!(
            parse_slurm_job_id("Submitted batch job 5821\n"),
            Some("5821".into())
        );
        assert_eq!(
            parse_slurm_job_id("Submitted batch job 5821 on cluster euler\n"),
            Some("5821".into())
        );
        assert_eq!(
            parse_slurm_job_id(
                "sbatch: Warning: Your job requests an entire node\nSubmitted batch job 90210\n"
            ),
            Some("90210".into())
        );
        assert_eq!(parse_slurm_job_id("sbatch: error: invalid partition\n"), None);
        assert_eq!(parse_slurm_job_id(""), None);
    }

    #[test]
    fn pbs_submission_stdout_parses() {
        assert_eq!(
            parse_pbs_job_id("5821.master.cluster.local\n"),
            Some("5821".into())
        );
        assert_eq!(parse_pbs_job_id("104297.pbs01\n"), Some("104297".into()));
        assert_eq!(parse_pbs_job_id("qsub: would exceed queue limit\n"), None);
        assert_eq!(parse_pbs_job_id(""), None);
    }

    #[test]
    fn slurm_states_map_onto_the_four_state_machine() {
        assert_eq!(map_slurm_state("PENDING"), Some(BackendJobState::Waiting));
        assert_eq!(map_slurm_state("RUNNING"), Some(BackendJobState::Running));
        // Resources not yet released; the output may still be in flight.
        assert_eq!(
            map_slurm_state("COMPLETING"),
            Some(BackendJobState::Running)
        );
        assert_eq!(
            map_slurm_state("COMPLETED"),
            Some(BackendJobState::Finished)
        );
        assert_eq!(map_slurm_state(""), Some(BackendJobState::Gone));
        assert!(matches!(
            map_slurm_state("NODE_FAIL"),
            Some(BackendJobState::Failed(_))
        ));
        assert!(matches!(
            map_slurm_state("CANCELLED+"),
            Some(BackendJobState::Failed(_))
        ));
        assert!(matches!(
            map_slurm_state("CANCELLED by 1000"),
            Some(BackendJobState::Failed(_))
        ));
        assert_eq!(map_slurm_state("SOMETHING_NEW"), None);
    }

    #[test]
    fn pbs_states_map_onto_the_four_state_machine() {
        assert_eq!(map_pbs_state("Q"), Some(BackendJobState::Waiting));
        assert_eq!(map_pbs_state("H"), Some(BackendJobState::Waiting));
        assert_eq!(map_pbs_state("R"), Some(BackendJobState::Running));
        assert_eq!(map_pbs_state("E"), Some(BackendJobState::Running));
        assert_eq!(map_pbs_state("C"), Some(BackendJobState::Finished));
        assert_eq!(map_pbs_state(""), Some(BackendJobState::Gone));
        assert_eq!(map_pbs_state("X"), None);
    }

    #[test]
    fn qstat_full_output_yields_the_state_letter() {
        let stdout = "Job Id: 5821.master\n    Job_Name = bending_beam_4\n    \
                      job_state = R\n    queue = compute\n";
        assert_eq!(parse_qstat_state(stdout), Some("R".into()));
        assert_eq!(parse_qstat_state("no such job"), None);
    }

    #[test]
    fn slurm_script_carries_resources_and_command() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _registry) = scheduler_with_flavor(dir.path(), ClusterFlavor::Slurm);
        let driver = Driver::new(scheduler.context.clone(), 4, 1);

        let script = scheduler.submission_script(&driver).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=bending_beam_4"));
        assert!(script.contains("#SBATCH --partition=compute"));
        assert!(script.contains("#SBATCH --time=02:00:00"));
        assert!(script.contains("#SBATCH --nodes=2"));
        assert!(script.contains("#SBATCH --ntasks-per-node=8"));
        assert!(script.contains(&driver.launch_command()));
    }

    #[test]
    fn pbs_script_carries_resources_and_command() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _registry) = scheduler_with_flavor(dir.path(), ClusterFlavor::Pbs);
        let driver = Driver::new(scheduler.context.clone(), 4, 1);

        let script = scheduler.submission_script(&driver).unwrap();
        assert!(script.contains("#PBS -N bending_beam_4"));
        assert!(script.contains("#PBS -q compute"));
        assert!(script.contains("#PBS -l walltime=02:00:00"));
        assert!(script.contains("#PBS -l nodes=2:ppn=8"));
        assert!(script.contains(&driver.launch_command()));
    }

    #[tokio::test]
    async fn failed_submission_leaves_the_job_new() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, registry) = scheduler_with_flavor(dir.path(), ClusterFlavor::Slurm);

        let mut parameters = ParameterSet::new();
        parameters.insert("x".into(), ParameterValue::Float(1.0));
        registry.save(Job::new(4, 1, parameters)).await.unwrap();

        // No slurm installation here: sbatch exits through the shell with a
        // command-not-found failure.
        let err = scheduler.submit(4, 1).await.unwrap_err();
        assert!(matches!(
            err,
            GtError::Submission(SubmissionError::CommandFailed { .. })
        ));

        let job = registry.load(4, 1).await.unwrap();
        assert_eq!(job.status, JobStatus::New);
        assert_eq!(job.handle, ProcessHandle::None);
    }
}
