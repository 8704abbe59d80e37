//! Job records and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A concrete value bound to one simulation input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Ordered parameter name -> value mapping for one job.
///
/// Ordered so input rendering and logs are reproducible across runs.
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// Lifecycle state of a job.
///
/// Legal transitions:
///
/// ```text
/// New -> Submitted -> Running -> Complete
///              \          \----> Failed
///               \--> Complete | Failed   (backend finished before first poll)
/// Failed -> Submitted                    (restart only)
/// ```
///
/// Terminal states never transition on their own; a fresh evaluation needs a
/// fresh job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    Submitted,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// A same-state "transition" is always allowed so idempotent status
    /// refreshes are cheap. `restart` enables the single back-edge
    /// Failed -> Submitted.
    pub fn can_transition_to(&self, next: JobStatus, restart: bool) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (Self::New, Self::Submitted) => true,
            (Self::Submitted, Self::Running) => true,
            (Self::Submitted, Self::Complete) => true,
            (Self::Submitted, Self::Failed) => true,
            (Self::Running, Self::Complete) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Failed, Self::Submitted) => restart,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific identifier for a launched process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessHandle {
    /// No live process is associated with the job (fresh jobs, harvested
    /// restarts).
    None,
    /// Operating-system pid of a directly spawned process.
    Pid(u32),
    /// Identifier assigned by a batch system (PBS/Slurm).
    ClusterJob(String),
    /// Task identifier assigned by a container-task service.
    Task(String),
}

impl ProcessHandle {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Pid(pid) => write!(f, "pid:{pid}"),
            Self::ClusterJob(id) => write!(f, "cluster:{id}"),
            Self::Task(arn) => write!(f, "task:{arn}"),
        }
    }
}

/// Numeric result extracted from a finished job's raw output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub values: Vec<f64>,
    /// The raw output file the values were read from.
    pub raw_path: PathBuf,
    pub recorded_at: DateTime<Utc>,
}

impl JobOutput {
    pub fn new(values: Vec<f64>, raw_path: PathBuf) -> Self {
        Self {
            values,
            raw_path,
            recorded_at: Utc::now(),
        }
    }
}

/// A single evaluation request: one parameter vector bound for one run of the
/// external simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    /// Jobs issued together share a batch and are polled together.
    pub batch: u32,
    pub parameters: ParameterSet,
    pub status: JobStatus,
    pub handle: ProcessHandle,
    /// Re-attach to a previously issued job instead of launching a new
    /// process.
    pub restart: bool,
    pub output: Option<JobOutput>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: u64, batch: u32, parameters: ParameterSet) -> Self {
        Self {
            id,
            batch,
            parameters,
            status: JobStatus::New,
            handle: ProcessHandle::None,
            restart: false,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn mark_submitted(&mut self, handle: ProcessHandle) {
        self.status = JobStatus::Submitted;
        self.handle = handle;
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, output: JobOutput) {
        self.status = JobStatus::Complete;
        self.finished_at = Some(Utc::now());
        self.output = Some(output);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parameters() -> ParameterSet {
        let mut parameters = ParameterSet::new();
        parameters.insert("youngs_modulus".into(), ParameterValue::Float(2.1e5));
        parameters.insert("num_elements".into(), ParameterValue::Int(64));
        parameters.insert("material".into(), ParameterValue::Text("steel".into()));
        parameters
    }

    #[test]
    fn forward_transitions() {
        assert!(JobStatus::New.can_transition_to(JobStatus::Submitted, false));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Running, false));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Complete, false));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Failed, false));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Complete, false));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed, false));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!JobStatus::New.can_transition_to(JobStatus::Running, false));
        assert!(!JobStatus::New.can_transition_to(JobStatus::Complete, false));
        assert!(!JobStatus::New.can_transition_to(JobStatus::Failed, false));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Submitted, false));
        assert!(!JobStatus::Complete.can_transition_to(JobStatus::Submitted, true));
        assert!(!JobStatus::Complete.can_transition_to(JobStatus::Failed, false));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running, true));
    }

    #[test]
    fn restart_enables_failed_back_edge() {
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Submitted, false));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Submitted, true));
    }

    #[test]
    fn same_state_is_always_legal() {
        for status in [
            JobStatus::New,
            JobStatus::Submitted,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert!(status.can_transition_to(status, false));
        }
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new(3, 1, sample_parameters());
        assert_eq!(job.status, JobStatus::New);
        assert!(job.handle.is_none());

        job.mark_submitted(ProcessHandle::Pid(4711));
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.handle, ProcessHandle::Pid(4711));

        job.mark_running();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        let output = JobOutput::new(vec![1.25], PathBuf::from("/tmp/out.csv"));
        job.mark_completed(output);
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.finished_at.is_some());
        assert_eq!(job.output.as_ref().unwrap().values, vec![1.25]);
    }

    #[test]
    fn job_failure_records_error() {
        let mut job = Job::new(4, 1, ParameterSet::new());
        job.mark_submitted(ProcessHandle::ClusterJob("5821".into()));
        job.mark_failed("walltime exceeded".into());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("walltime exceeded"));
    }

    #[test]
    fn handle_display() {
        assert_eq!(ProcessHandle::None.to_string(), "none");
        assert_eq!(ProcessHandle::Pid(99).to_string(), "pid:99");
        assert_eq!(
            ProcessHandle::ClusterJob("5821".into()).to_string(),
            "cluster:5821"
        );
        assert_eq!(
            ProcessHandle::Task("arn:aws:ecs:task/abc".into()).to_string(),
            "task:arn:aws:ecs:task/abc"
        );
    }

    #[test]
    fn parameter_value_display() {
        assert_eq!(ParameterValue::Int(64).to_string(), "64");
        assert_eq!(ParameterValue::Float(0.5).to_string(), "0.5");
        assert_eq!(ParameterValue::Text("steel".into()).to_string(), "steel");
    }
}
