//! Task-service scheduler — submits jobs to an ECS-style container-task API.
//!
//! Jobs run as one-off tasks of a pre-registered task definition; the
//! driver's launch command is injected as a container command override. All
//! calls go through the service CLI over the transport, so the same code
//! path works locally and via SSH.

use async_trait::async_trait;
use gt_types::{
    config_error, GtResult, Job, JobStatus, PollingError, ProcessHandle, SubmissionError,
    TaskServiceOptions,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::{Driver, DriverContext};
use crate::scheduler::{
    early_status, harvest_restart, prepare_environment, release_environment,
    resolve_backend_state, BackendJobState, Scheduler,
};

/// What one `describe-tasks` answer says about a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProbe {
    pub last_status: String,
    pub exit_code: Option<i64>,
    pub stopped_reason: Option<String>,
}

/// Pull the task ARN out of `run-task` JSON output.
pub fn parse_task_arn(stdout: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    value
        .get("tasks")?
        .get(0)?
        .get("taskArn")?
        .as_str()
        .map(str::to_string)
}

/// Pull the rejection reason out of `run-task`/`describe-tasks` JSON output.
pub fn parse_task_failure(stdout: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let reason = value.get("failures")?.get(0)?.get("reason")?.as_str()?;
    Some(reason.to_string())
}

/// Parse one task out of `describe-tasks` JSON output.
pub fn parse_task_probe(stdout: &str) -> Option<TaskProbe> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let task = value.get("tasks")?.get(0)?;
    let last_status = task.get("lastStatus")?.as_str()?.to_string();
    let exit_code = task
        .get("containers")
        .and_then(|containers| containers.get(0))
        .and_then(|container| container.get("exitCode"))
        .and_then(|code| code.as_i64());
    let stopped_reason = task
        .get("stoppedReason")
        .and_then(|reason| reason.as_str())
        .map(str::to_string);
    Some(TaskProbe {
        last_status,
        exit_code,
        stopped_reason,
    })
}

/// Map a task lifecycle status onto the backend state.
///
/// A stopped task with no exit code (or exit 0) counts as finished; the
/// driver's output check decides whether the job actually succeeded.
pub fn map_task_state(probe: &TaskProbe) -> Option<BackendJobState> {
    match probe.last_status.as_str() {
        "PROVISIONING" | "PENDING" | "ACTIVATING" => Some(BackendJobState::Waiting),
        "RUNNING" | "DEACTIVATING" => Some(BackendJobState::Running),
        "STOPPING" | "DEPROVISIONING" | "STOPPED" => match probe.exit_code {
            Some(code) if code != 0 => {
                let mut reason = format!("task exited with code {code}");
                if let Some(stopped) = &probe.stopped_reason {
                    reason.push_str(": ");
                    reason.push_str(stopped);
                }
                Some(BackendJobState::Failed(reason))
            }
            _ => Some(BackendJobState::Finished),
        },
        "DELETED" | "MISSING" => Some(BackendJobState::Gone),
        _ => None,
    }
}

/// Submits container tasks and polls them by ARN.
pub struct TaskServiceScheduler {
    context: DriverContext,
    /// Stamped on every submission via `--started-by`, so an operator can
    /// tell this experiment's tasks apart in the service console.
    session: Uuid,
}

impl TaskServiceScheduler {
    pub fn new(context: DriverContext) -> Self {
        Self {
            context,
            session: Uuid::new_v4(),
        }
    }

    fn options(&self) -> GtResult<&TaskServiceOptions> {
        self.context
            .config
            .task_service
            .as_ref()
            .ok_or_else(|| config_error!("task service scheduler requires task service options"))
    }

    fn run_task_command(&self, launch_command: &str) -> GtResult<String> {
        let options = self.options()?;
        let overrides = serde_json::json!({
            "containerOverrides": [{
                "name": options.container_name,
                "command": ["sh", "-c", launch_command],
                "cpu": options.cpu,
                "memory": options.memory,
            }]
        });
        Ok(format!(
            "aws ecs run-task --cluster {} --task-definition {} --started-by {} --overrides '{}'",
            options.cluster_name, options.task_definition, self.session, overrides
        ))
    }

    async fn probe_arn(&self, arn: &str) -> GtResult<BackendJobState> {
        let options = self.options()?;
        let command = format!(
            "aws ecs describe-tasks --cluster {} --tasks {}",
            options.cluster_name, arn
        );
        let output = self
            .context
            .transport
            .run(&command)
            .await
            .map_err(|err| PollingError::ProbeFailed {
                message: err.to_string(),
            })?;
        if !output.success() {
            return Err(PollingError::ProbeFailed {
                message: output.stderr.trim().to_string(),
            }
            .into());
        }

        match parse_task_probe(&output.stdout) {
            Some(probe) => match map_task_state(&probe) {
                Some(state) => Ok(state),
                None => Err(PollingError::UnknownState {
                    state: probe.last_status,
                }
                .into()),
            },
            None => {
                if parse_task_failure(&output.stdout).is_some() {
                    // The service has already forgotten the task.
                    Ok(BackendJobState::Gone)
                } else {
                    Err(PollingError::ProbeFailed {
                        message: format!(
                            "unrecognized describe-tasks output: {}",
                            output.stdout.trim()
                        ),
                    }
                    .into())
                }
            }
        }
    }
}

#[async_trait]
impl Scheduler for TaskServiceScheduler {
    async fn submit(&self, job_id: u64, batch: u32) -> GtResult<ProcessHandle> {
        let job = self.context.registry.load(job_id, batch).await?;
        if job.restart && job.status != JobStatus::New {
            let still_alive = self.alive(&job.handle).await?;
            return harvest_restart(&self.context, &job, still_alive).await;
        }

        let driver = Driver::new(self.context.clone(), job_id, batch);
        driver.pre_job_run().await?;

        let command = self.run_task_command(&driver.launch_command())?;
        info!(job_id, batch, session = %self.session, "submitting container task");
        let output = self
            .context
            .transport
            .run(&command)
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

        match parse_task_arn(&output.stdout) {
            Some(arn) => {
                debug!(job_id, batch, arn = %arn, "task accepted");
                let handle = ProcessHandle::Task(arn);
                self.context
                    .registry
                    .record_handle(job_id, batch, handle.clone())
                    .await?;
                Ok(handle)
            }
            None => match parse_task_failure(&output.stdout) {
                Some(reason) => Err(SubmissionError::Rejected { job_id, reason }.into()),
                None => Err(SubmissionError::UnparseableJobId {
                    output: output.stdout.clone(),
                }
                .into()),
            },
        }
    }

    async fn check_job_completion(&self, job: &Job) -> GtResult<JobStatus> {
        if let Some(status) = early_status(job) {
            return Ok(status);
        }
        let state = match &job.handle {
            ProcessHandle::Task(arn) => self.probe_arn(arn).await?,
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
            ProcessHandle::Task(arn) => {
                let state = self.probe_arn(arn).await?;
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
    use gt_types::{DriverConfig, SchedulerConfig, SchedulerKind};
    use std::path::Path;
    use std::sync::Arc;

    const RUN_TASK_OK: &str = r#"{
        "tasks": [
            {
                "taskArn": "arn:aws:ecs:eu-central-1:123456789012:task/sim-cluster/9f6ab3a0",
                "lastStatus": "PROVISIONING"
            }
        ],
        "failures": []
    }"#;

    const RUN_TASK_REJECTED: &str = r#"{
        "tasks": [],
        "failures": [
            {
                "arn": "arn:aws:ecs:eu-central-1:123456789012:container-instance/abc",
                "reason": "RESOURCE:MEMORY"
            }
        ]
    }"#;

    const DESCRIBE_RUNNING: &str = r#"{
        "tasks": [
            {
                "taskArn": "arn:aws:ecs:eu-central-1:123456789012:task/sim-cluster/9f6ab3a0",
                "lastStatus": "RUNNING",
                "containers": [{"name": "simulation"}]
            }
        ],
        "failures": []
    }"#;

    const DESCRIBE_STOPPED_OK: &str = r#"{
        "tasks": [
            {
                "taskArn": "arn:aws:ecs:eu-central-1:123456789012:task/sim-cluster/9f6ab3a0",
                "lastStatus": "STOPPED",
                "stoppedReason": "Essential container in task exited",
                "containers": [{"name": "simulation", "exitCode": 0}]
            }
        ],
        "failures": []
    }"#;

    const DESCRIBE_STOPPED_FAILED: &str = r#"{
        "tasks": [
            {
                "taskArn": "arn:aws:ecs:eu-central-1:123456789012:task/sim-cluster/9f6ab3a0",
                "lastStatus": "STOPPED",
                "stoppedReason": "Essential container in task exited",
                "containers": [{"name": "simulation", "exitCode": 137}]
            }
        ],
        "failures": []
    }"#;

    fn scheduler(dir: &Path) -> TaskServiceScheduler {
        let template = dir.join("sim.tmpl");
        std::fs::write(&template, "{{ x }}\n").unwrap();
        let options = TaskServiceOptions {
            cluster_name: "sim-cluster".into(),
            task_definition: "gantry-sim:3".into(),
            container_name: "simulation".into(),
            cpu: 2048,
            memory: 4096,
        };
        let config = SchedulerConfig::new(
            SchedulerKind::TaskService,
            "bowl",
            dir,
            DriverConfig::new("./solver", &template),
        )
        .with_task_service(options);
        let context = DriverContext {
            config: Arc::new(config),
            registry: Arc::new(InMemoryRegistry::new()),
            transport: Transport::local(),
            templater: Arc::new(PlaceholderTemplater::new()),
            post_processor: Arc::new(CsvColumnReader::new()),
            sandbox: None,
        };
        TaskServiceScheduler::new(context)
    }

    #[test]
    fn run_task_output_yields_the_arn() {
        assert_eq!(
            parse_task_arn(RUN_TASK_OK).unwrap(),
            "arn:aws:ecs:eu-central-1:123456789012:task/sim-cluster/9f6ab3a0"
        );
        assert_eq!(parse_task_arn(RUN_TASK_REJECTED), None);
        assert_eq!(parse_task_arn("not json"), None);
    }

    #[test]
    fn rejected_submissions_carry_a_reason() {
        assert_eq!(
            parse_task_failure(RUN_TASK_REJECTED).unwrap(),
            "RESOURCE:MEMORY"
        );
        assert_eq!(parse_task_failure(RUN_TASK_OK), None);
    }

    #[test]
    fn describe_output_parses_into_probes() {
        let running = parse_task_probe(DESCRIBE_RUNNING).unwrap();
        assert_eq!(running.last_status, "RUNNING");
        assert_eq!(running.exit_code, None);

        let stopped = parse_task_probe(DESCRIBE_STOPPED_FAILED).unwrap();
        assert_eq!(stopped.last_status, "STOPPED");
        assert_eq!(stopped.exit_code, Some(137));
        assert!(stopped.stopped_reason.unwrap().contains("exited"));
    }

    #[test]
    fn task_states_map_onto_the_four_state_machine() {
        let probe = |status: &str, exit_code| TaskProbe {
            last_status: status.to_string(),
            exit_code,
            stopped_reason: None,
        };

        assert_eq!(
            map_task_state(&probe("PROVISIONING", None)),
            Some(BackendJobState::Waiting)
        );
        assert_eq!(
            map_task_state(&probe("PENDING", None)),
            Some(BackendJobState::Waiting)
        );
        assert_eq!(
            map_task_state(&probe("RUNNING", None)),
            Some(BackendJobState::Running)
        );
        assert_eq!(
            map_task_state(&probe("STOPPED", Some(0))),
            Some(BackendJobState::Finished)
        );
        assert_eq!(
            map_task_state(&probe("STOPPED", None)),
            Some(BackendJobState::Finished)
        );
        assert!(matches!(
            map_task_state(&probe("STOPPED", Some(137))),
            Some(BackendJobState::Failed(reason)) if reason.contains("137")
        ));
        assert_eq!(
            map_task_state(&probe("MISSING", None)),
            Some(BackendJobState::Gone)
        );
        assert_eq!(map_task_state(&probe("SOMETHING_NEW", None)), None);
    }

    #[test]
    fn run_task_command_stamps_session_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());

        let command = scheduler
            .run_task_command("./solver in.dat out.csv")
            .unwrap();
        assert!(command.starts_with("aws ecs run-task --cluster sim-cluster"));
        assert!(command.contains("--task-definition gantry-sim:3"));
        assert!(command.contains(&format!("--started-by {}", scheduler.session)));
        assert!(command.contains(r#""name":"simulation""#));
        assert!(command.contains(r#""command":["sh","-c","./solver in.dat out.csv"]"#));
        assert!(command.contains(r#""cpu":2048"#));
    }
}
