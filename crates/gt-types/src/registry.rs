//! Storage interface for job records.

use async_trait::async_trait;

use crate::errors::RegistryError;
use crate::job::{Job, JobOutput, JobStatus, ProcessHandle};

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Persistence seam between schedulers and job storage.
///
/// Schedulers and drivers never touch storage directly; everything flows
/// through this trait. Implementations must serialize updates to the same
/// job, so two status writes can never interleave, and must enforce the
/// [`JobStatus`] transition rules.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert or replace a job record.
    async fn save(&self, job: Job) -> RegistryResult<()>;

    /// Load a job by id within a batch.
    async fn load(&self, job_id: u64, batch: u32) -> RegistryResult<Job>;

    /// Move a job to `status`, rejecting illegal transitions. Same-state
    /// updates are no-ops so repeated polls stay cheap.
    async fn update_status(
        &self,
        job_id: u64,
        batch: u32,
        status: JobStatus,
    ) -> RegistryResult<()>;

    /// Record the backend handle of a submitted job.
    async fn record_handle(
        &self,
        job_id: u64,
        batch: u32,
        handle: ProcessHandle,
    ) -> RegistryResult<()>;

    /// Atomically store `output` and move the job to [`JobStatus::Complete`].
    async fn complete_job(&self, job_id: u64, batch: u32, output: JobOutput)
        -> RegistryResult<()>;

    /// Atomically record `error` and move the job to [`JobStatus::Failed`].
    async fn fail_job(&self, job_id: u64, batch: u32, error: String) -> RegistryResult<()>;

    /// Record `error` without touching the job's status, for failures that
    /// leave the job at its last good state (a rejected submission keeps the
    /// job New, but the cause still belongs on the record).
    async fn record_error(&self, job_id: u64, batch: u32, error: String) -> RegistryResult<()>;

    /// All jobs belonging to a batch, ordered by id.
    async fn jobs_in_batch(&self, batch: u32) -> RegistryResult<Vec<Job>>;
}
