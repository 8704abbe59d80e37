//! In-memory job registry for local experiments and tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use gt_types::{
    Job, JobOutput, JobRegistry, JobStatus, ProcessHandle, RegistryError, RegistryResult,
};
use tracing::debug;

/// [`JobRegistry`] backed by a concurrent map.
///
/// Each write holds the job's map entry for the duration of the update, so
/// exactly one submit/check path mutates a given job at a time.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    jobs: DashMap<(u64, u32), Job>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobRegistry for InMemoryRegistry {
    async fn save(&self, job: Job) -> RegistryResult<()> {
        debug!(job_id = job.id, batch = job.batch, status = %job.status, "saving job");
        self.jobs.insert((job.id, job.batch), job);
        Ok(())
    }

    async fn load(&self, job_id: u64, batch: u32) -> RegistryResult<Job> {
        self.jobs
            .get(&(job_id, batch))
            .map(|entry| entry.clone())
            .ok_or(RegistryError::JobNotFound { job_id, batch })
    }

    async fn update_status(
        &self,
        job_id: u64,
        batch: u32,
        status: JobStatus,
    ) -> RegistryResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&(job_id, batch))
            .ok_or(RegistryError::JobNotFound { job_id, batch })?;
        if entry.status == status {
            return Ok(());
        }
        if !entry.status.can_transition_to(status, entry.restart) {
            return Err(RegistryError::IllegalTransition {
                job_id,
                from: entry.status.to_string(),
                to: status.to_string(),
            });
        }
        match status {
            JobStatus::Running => entry.mark_running(),
            JobStatus::Complete | JobStatus::Failed => {
                entry.status = status;
                entry.finished_at = Some(Utc::now());
            }
            JobStatus::New | JobStatus::Submitted => entry.status = status,
        }
        debug!(job_id, batch, status = %status, "job status updated");
        Ok(())
    }

    async fn record_handle(
        &self,
        job_id: u64,
        batch: u32,
        handle: ProcessHandle,
    ) -> RegistryResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&(job_id, batch))
            .ok_or(RegistryError::JobNotFound { job_id, batch })?;
        if !entry
            .status
            .can_transition_to(JobStatus::Submitted, entry.restart)
        {
            return Err(RegistryError::IllegalTransition {
                job_id,
                from: entry.status.to_string(),
                to: JobStatus::Submitted.to_string(),
            });
        }
        debug!(job_id, batch, handle = %handle, "recording handle");
        entry.mark_submitted(handle);
        Ok(())
    }

    async fn complete_job(&self, job_id: u64, batch: u32, output: JobOutput) -> RegistryResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&(job_id, batch))
            .ok_or(RegistryError::JobNotFound { job_id, batch })?;
        // The first recorded result stands.
        if entry.status == JobStatus::Complete {
            return Ok(());
        }
        if !entry
            .status
            .can_transition_to(JobStatus::Complete, entry.restart)
        {
            return Err(RegistryError::IllegalTransition {
                job_id,
                from: entry.status.to_string(),
                to: JobStatus::Complete.to_string(),
            });
        }
        entry.mark_completed(output);
        Ok(())
    }

    async fn fail_job(&self, job_id: u64, batch: u32, error: String) -> RegistryResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&(job_id, batch))
            .ok_or(RegistryError::JobNotFound { job_id, batch })?;
        if entry.status == JobStatus::Failed {
            return Ok(());
        }
        if !entry
            .status
            .can_transition_to(JobStatus::Failed, entry.restart)
        {
            return Err(RegistryError::IllegalTransition {
                job_id,
                from: entry.status.to_string(),
                to: JobStatus::Failed.to_string(),
            });
        }
        entry.mark_failed(error);
        Ok(())
    }

    async fn record_error(&self, job_id: u64, batch: u32, error: String) -> RegistryResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&(job_id, batch))
            .ok_or(RegistryError::JobNotFound { job_id, batch })?;
        debug!(job_id, batch, %error, "recording error");
        entry.error = Some(error);
        Ok(())
    }

    async fn jobs_in_batch(&self, batch: u32) -> RegistryResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.batch == batch)
            .map(|entry| entry.clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}
