use thiserror::Error;

/// Main error type for the Gantry system
#[derive(Error, Debug)]
pub enum GtError {
    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Post-processing error: {0}")]
    PostProcessing(#[from] PostProcessingError),

    #[error("Polling error: {0}")]
    Polling(#[from] PollingError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while handing a job to an execution backend.
///
/// Fatal for the job in question; the job's status is left at its last good
/// state, never silently advanced to running.
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("backend rejected job {job_id}: {reason}")]
    Rejected { job_id: u64, reason: String },

    #[error("could not start job {job_id}: {message}")]
    LaunchFailed { job_id: u64, message: String },

    #[error("submission command exited with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("could not parse a job id from submission output: {output:?}")]
    UnparseableJobId { output: String },

    #[error("job {job_id} is not in a submittable state ({status})")]
    NotSubmittable { job_id: u64, status: String },
}

/// Errors raised by the command transport (local shell or SSH).
///
/// Retried only where the caller explicitly configures retries.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command:?} exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{command:?} was terminated by a signal")]
    Signalled { command: String },

    #[error("copy from {from} to {to} failed: {stderr}")]
    CopyFailed {
        from: String,
        to: String,
        stderr: String,
    },

    #[error("unexpected output from {command:?}: {message}")]
    MalformedOutput { command: String, message: String },
}

/// Errors raised while preparing the container image or sandbox.
///
/// A failed image build aborts the whole experiment, not just one job.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("container image build failed: {stderr}")]
    BuildFailed { stderr: String },

    #[error("container image missing at {path} and no definition file configured")]
    ImageMissing { path: String },

    #[error("container command failed: {message}")]
    CommandFailed { message: String },
}

/// Errors raised while extracting results from raw simulation output.
///
/// The affected job is marked failed; other jobs in the batch continue.
#[derive(Error, Debug)]
pub enum PostProcessingError {
    #[error("output file not found: {path}")]
    OutputMissing { path: String },

    #[error("output file {path} could not be parsed: {message}")]
    Unparseable { path: String, message: String },

    #[error("no values matched the configured selection in {path}")]
    EmptySelection { path: String },
}

/// Errors raised while querying backend job state.
///
/// Transient: the caller logs them and probes again on the next poll.
#[derive(Error, Debug)]
pub enum PollingError {
    #[error("status probe failed: {message}")]
    ProbeFailed { message: String },

    #[error("backend reported unrecognized state {state:?}")]
    UnknownState { state: String },

    #[error("handle {handle} cannot be polled by this backend")]
    ForeignHandle { handle: String },

    #[error("batch {batch} exceeded the polling budget ({polls} polls, {outstanding} jobs outstanding)")]
    BudgetExhausted {
        batch: u32,
        polls: u32,
        outstanding: usize,
    },
}

/// Errors raised by job registries.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job {job_id} in batch {batch} not found")]
    JobNotFound { job_id: u64, batch: u32 },

    #[error("illegal status transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: u64,
        from: String,
        to: String,
    },

    #[error("registry backend error: {message}")]
    Backend { message: String },
}

/// Errors raised while rendering job input files.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template file not found: {path}")]
    TemplateMissing { path: String },

    #[error("unresolved placeholder {placeholder:?} in template")]
    UnresolvedPlaceholder { placeholder: String },

    #[error("could not write rendered input to {path}: {message}")]
    WriteFailed { path: String, message: String },
}

/// Result type alias for Gantry operations
pub type GtResult<T> = Result<T, GtError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::GtError::Config(format!($($arg)*))
    };
}
