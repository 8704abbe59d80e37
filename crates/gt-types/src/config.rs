//! Scheduler and driver configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config_error;
use crate::errors::{GtError, GtResult};

/// Which execution backend a scheduler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Spawn the simulation directly on the local or remote host.
    Direct,
    /// Submit to an HPC batch system (PBS or Slurm).
    Batch,
    /// Submit to a container-task service.
    TaskService,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Batch => "batch",
            Self::TaskService => "task_service",
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = GtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "batch" => Ok(Self::Batch),
            "task_service" => Ok(Self::TaskService),
            other => Err(config_error!(
                "unknown scheduler kind {other:?}; valid kinds are: direct, batch, task_service"
            )),
        }
    }
}

/// Batch system flavor for [`SchedulerKind::Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterFlavor {
    Pbs,
    Slurm,
}

/// How completion is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between consecutive status probes of one batch.
    pub interval_secs: u64,
    /// Upper bound on probes per batch; `None` polls until terminal.
    pub max_polls: Option<u32>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_polls: None,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Local end of an SSH port forward held open for the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub local_port: u16,
    pub remote_port: u16,
}

/// Remote execution settings (SSH).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Host name or address of the machine that runs the jobs.
    pub host: String,
    /// User name on the remote host; the current user when absent.
    pub user: Option<String>,
    /// Port forward opened by `pre_run` and closed by `post_run`.
    pub port_forward: Option<PortForward>,
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port_forward: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port_forward(mut self, local_port: u16, remote_port: u16) -> Self {
        self.port_forward = Some(PortForward {
            local_port,
            remote_port,
        });
        self
    }

    /// `user@host` destination string handed to ssh/scp.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Container sandbox settings (Singularity/Apptainer images).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Path of the image file (`.sif`).
    pub image: PathBuf,
    /// Definition file the image is built from when it is missing.
    pub definition: Option<PathBuf>,
    /// Host paths bound into the container.
    pub bind_paths: Vec<PathBuf>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            definition: None,
            bind_paths: Vec::new(),
        }
    }

    pub fn with_definition(mut self, definition: impl Into<PathBuf>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    pub fn with_bind_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bind_paths.push(path.into());
        self
    }
}

/// Batch-system submission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterOptions {
    pub flavor: ClusterFlavor,
    /// Queue (PBS) or partition (Slurm) to submit into.
    pub queue: String,
    /// Wall-clock limit in `HH:MM:SS`.
    pub walltime: String,
    pub num_nodes: u32,
    pub procs_per_node: u32,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            flavor: ClusterFlavor::Slurm,
            queue: "batch".to_string(),
            walltime: "24:00:00".to_string(),
            num_nodes: 1,
            procs_per_node: 1,
        }
    }
}

/// Container-task service submission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskServiceOptions {
    /// Cluster the tasks run on.
    pub cluster_name: String,
    /// Registered task definition to launch.
    pub task_definition: String,
    /// Container inside the task definition whose command is overridden.
    pub container_name: String,
    /// CPU units reserved per task.
    pub cpu: u32,
    /// Memory (MiB) reserved per task.
    pub memory: u32,
}

/// How one job turns into an external process invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Executable (or shell command) that runs the simulation. It is invoked
    /// with the rendered input file and the output file as its last two
    /// arguments.
    pub executable: String,
    /// Template the parameter values are injected into.
    pub input_template: PathBuf,
    /// Extra arguments placed before the input path.
    pub args: Vec<String>,
}

impl DriverConfig {
    pub fn new(executable: impl Into<String>, input_template: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            input_template: input_template.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Top-level scheduler configuration.
///
/// Immutable once a scheduler has been constructed: container and remote
/// settings hold for the lifetime of the experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// Name used for job names, file names, and backend tags.
    pub experiment_name: String,
    /// Directory all job inputs, scripts, and outputs live under.
    pub experiment_dir: PathBuf,
    pub driver: DriverConfig,
    pub polling: PollingConfig,
    /// Re-attach to previously issued jobs instead of launching new
    /// processes.
    pub restart: bool,
    /// Directly spawned jobs run detached; when false, `submit` blocks until
    /// the process exits and post-processes inline.
    pub detach: bool,
    /// Maximum number of jobs in flight per batch.
    pub max_concurrent: usize,
    /// Extra attempts for transport commands that stage job files; zero
    /// means every shell failure surfaces immediately.
    pub transport_retries: u32,
    pub remote: Option<RemoteConfig>,
    pub container: Option<ContainerConfig>,
    pub cluster: Option<ClusterOptions>,
    pub task_service: Option<TaskServiceOptions>,
}

impl SchedulerConfig {
    pub fn new(
        kind: SchedulerKind,
        experiment_name: impl Into<String>,
        experiment_dir: impl Into<PathBuf>,
        driver: DriverConfig,
    ) -> Self {
        Self {
            kind,
            experiment_name: experiment_name.into(),
            experiment_dir: experiment_dir.into(),
            driver,
            polling: PollingConfig::default(),
            restart: false,
            detach: true,
            max_concurrent: 4,
            transport_retries: 0,
            remote: None,
            container: None,
            cluster: None,
            task_service: None,
        }
    }

    pub fn with_polling(mut self, interval_secs: u64, max_polls: Option<u32>) -> Self {
        self.polling = PollingConfig {
            interval_secs,
            max_polls,
        };
        self
    }

    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_transport_retries(mut self, retries: u32) -> Self {
        self.transport_retries = retries;
        self
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_container(mut self, container: ContainerConfig) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterOptions) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_task_service(mut self, options: TaskServiceOptions) -> Self {
        self.task_service = Some(options);
        self
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Cross-check the backend kind against its required option block and
    /// normalize user-supplied paths. Scheduler construction calls this
    /// before anything runs, so bad configurations fail up front.
    pub fn validate(&mut self) -> GtResult<()> {
        if self.experiment_name.is_empty() {
            return Err(config_error!("experiment_name must not be empty"));
        }
        if self.driver.executable.is_empty() {
            return Err(config_error!("driver.executable must not be empty"));
        }
        if self.polling.interval_secs == 0 {
            return Err(config_error!("polling.interval_secs must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(config_error!("max_concurrent must be at least 1"));
        }

        match self.kind {
            SchedulerKind::Batch if self.cluster.is_none() => {
                return Err(config_error!(
                    "scheduler kind 'batch' requires cluster options (flavor, queue, walltime)"
                ));
            }
            SchedulerKind::TaskService if self.task_service.is_none() => {
                return Err(config_error!(
                    "scheduler kind 'task_service' requires task service options \
                     (cluster_name, task_definition, container_name)"
                ));
            }
            _ => {}
        }

        self.experiment_dir = expand_home(&self.experiment_dir);
        self.driver.input_template = expand_home(&self.driver.input_template);
        if let Some(container) = &mut self.container {
            container.image = expand_home(&container.image);
            if let Some(definition) = &container.definition {
                container.definition = Some(expand_home(definition));
            }
        }
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
