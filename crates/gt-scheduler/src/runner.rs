//! Experiment runner — the caller-side submit-and-poll loop.
//!
//! The statistical layer above Gantry only wants "evaluate these parameter
//! vectors, give me the terminal job records back". [`ExperimentRunner`]
//! owns a [`Scheduler`], creates the job records for a batch, keeps up to
//! `max_concurrent` of them in flight, and polls `check_job_completion` at
//! the configured interval until the whole batch is terminal. Per-job
//! failures are recorded and the batch continues; experiment-level errors
//! abort.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::Sender;
use gt_types::{
    GtError, GtResult, Job, JobRegistry, JobStatus, ParameterSet, PollingError, SchedulerConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// Events emitted by the runner for external consumption (logging, UI,
/// alerting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExperimentEvent {
    BatchStarted {
        batch: u32,
        jobs: usize,
    },
    JobSubmitted {
        job_id: u64,
        batch: u32,
        handle: String,
    },
    JobStarted {
        job_id: u64,
        batch: u32,
    },
    JobCompleted {
        job_id: u64,
        batch: u32,
    },
    JobFailed {
        job_id: u64,
        batch: u32,
        error: String,
    },
    PollRetried {
        batch: u32,
        message: String,
    },
    BatchFinished {
        batch: u32,
        completed: usize,
        failed: usize,
    },
}

/// Running totals across every batch the runner has driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentStats {
    pub batches_run: u32,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub polls: u64,
}

/// Counters and id allocation shared by all batches of one runner.
#[derive(Debug)]
struct RunnerState {
    next_job_id: u64,
    next_batch: u32,
    stats: ExperimentStats,
}

impl Default for RunnerState {
    fn default() -> Self {
        Self {
            next_job_id: 1,
            next_batch: 1,
            stats: ExperimentStats::default(),
        }
    }
}

/// Drives batches of evaluations through a [`Scheduler`].
///
/// Job ids are allocated sequentially across the experiment and batches are
/// numbered from 1, so `(job_id, batch)` keys in the registry stay unique
/// without any external coordination.
pub struct ExperimentRunner {
    scheduler: Box<dyn Scheduler>,
    registry: Arc<dyn JobRegistry>,
    config: Arc<SchedulerConfig>,
    session: Uuid,
    event_tx: Option<Sender<ExperimentEvent>>,
    state: Mutex<RunnerState>,
}

impl ExperimentRunner {
    pub fn new(
        scheduler: Box<dyn Scheduler>,
        registry: Arc<dyn JobRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let session = Uuid::new_v4();
        info!(
            %session,
            experiment = %config.experiment_name,
            kind = config.kind.as_str(),
            "experiment runner created"
        );
        Self {
            scheduler,
            registry,
            config: Arc::new(config),
            session,
            event_tx: None,
            state: Mutex::new(RunnerState::default()),
        }
    }

    /// Attach an event channel. Events are best-effort: a disconnected
    /// receiver never fails the experiment.
    pub fn with_events(mut self, event_tx: Sender<ExperimentEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn stats(&self) -> ExperimentStats {
        self.state.lock().stats
    }

    /// Prepare the experiment (container image, port forward) before the
    /// first batch.
    pub async fn pre_run(&self) -> GtResult<()> {
        self.scheduler.pre_run().await
    }

    /// Release experiment-wide resources after the last batch.
    pub async fn post_run(&self) -> GtResult<()> {
        self.scheduler.post_run().await
    }

    fn emit(&self, event: ExperimentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Errors confined to one job: the batch keeps going, the cause is
    /// recorded. Everything else aborts the experiment.
    fn job_scoped(error: &GtError) -> bool {
        matches!(
            error,
            GtError::Submission(_) | GtError::Transport(_) | GtError::PostProcessing(_)
        )
    }

    /// Evaluate one batch of parameter sets to completion.
    ///
    /// Creates one job per parameter set, submits up to `max_concurrent` at
    /// a time, and polls the scheduler at `polling.interval` until every job
    /// is terminal. Returns the batch's job records, ordered by id, with
    /// outputs populated on the completed ones. Fails with
    /// [`PollingError::BudgetExhausted`] when `polling.max_polls` runs out
    /// with jobs still outstanding.
    pub async fn run_batch(&self, parameter_sets: Vec<ParameterSet>) -> GtResult<Vec<Job>> {
        let (batch, job_ids) = {
            let mut state = self.state.lock();
            let batch = state.next_batch;
            state.next_batch += 1;
            let first = state.next_job_id;
            state.next_job_id += parameter_sets.len() as u64;
            state.stats.batches_run += 1;
            (batch, (first..first + parameter_sets.len() as u64).collect::<Vec<_>>())
        };

        for (job_id, parameters) in job_ids.iter().zip(parameter_sets) {
            let job = Job::new(*job_id, batch, parameters).with_restart(self.config.restart);
            self.registry.save(job).await?;
        }
        info!(
            session = %self.session,
            batch,
            jobs = job_ids.len(),
            "batch started"
        );
        self.emit(ExperimentEvent::BatchStarted {
            batch,
            jobs: job_ids.len(),
        });

        let mut pending: VecDeque<u64> = job_ids.iter().copied().collect();
        let mut active: Vec<u64> = Vec::new();
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut polls: u32 = 0;

        loop {
            while active.len() < self.config.max_concurrent {
                let Some(job_id) = pending.pop_front() else {
                    break;
                };
                match self.scheduler.submit(job_id, batch).await {
                    Ok(handle) => {
                        self.state.lock().stats.jobs_submitted += 1;
                        self.emit(ExperimentEvent::JobSubmitted {
                            job_id,
                            batch,
                            handle: handle.to_string(),
                        });
                        active.push(job_id);
                    }
                    Err(error) if Self::job_scoped(&error) => {
                        // The job keeps its last good status; the cause goes
                        // on the record and the job drops out of this
                        // batch's polling.
                        warn!(job_id, batch, %error, "job submission failed");
                        self.registry
                            .record_error(job_id, batch, error.to_string())
                            .await?;
                        failed += 1;
                        self.state.lock().stats.jobs_failed += 1;
                        self.emit(ExperimentEvent::JobFailed {
                            job_id,
                            batch,
                            error: error.to_string(),
                        });
                    }
                    Err(error) => return Err(error),
                }
            }

            let mut still_active = Vec::with_capacity(active.len());
            for job_id in active.drain(..) {
                let job = self.registry.load(job_id, batch).await?;
                let before = job.status;
                let status = match self.scheduler.check_job_completion(&job).await {
                    Ok(status) => status,
                    Err(GtError::Polling(error)) => {
                        warn!(job_id, batch, %error, "status probe failed, retrying next poll");
                        self.emit(ExperimentEvent::PollRetried {
                            batch,
                            message: error.to_string(),
                        });
                        still_active.push(job_id);
                        continue;
                    }
                    Err(error) => return Err(error),
                };
                match status {
                    JobStatus::Complete => {
                        completed += 1;
                        self.state.lock().stats.jobs_completed += 1;
                        self.emit(ExperimentEvent::JobCompleted { job_id, batch });
                    }
                    JobStatus::Failed => {
                        failed += 1;
                        self.state.lock().stats.jobs_failed += 1;
                        let error = self
                            .registry
                            .load(job_id, batch)
                            .await?
                            .error
                            .unwrap_or_else(|| "backend reported failure".to_string());
                        self.emit(ExperimentEvent::JobFailed {
                            job_id,
                            batch,
                            error,
                        });
                    }
                    JobStatus::Running => {
                        if before != JobStatus::Running {
                            self.emit(ExperimentEvent::JobStarted { job_id, batch });
                        }
                        still_active.push(job_id);
                    }
                    JobStatus::New | JobStatus::Submitted => still_active.push(job_id),
                }
            }
            active = still_active;

            if active.is_empty() && pending.is_empty() {
                break;
            }

            polls += 1;
            self.state.lock().stats.polls += 1;
            if let Some(max_polls) = self.config.polling.max_polls {
                if polls >= max_polls {
                    return Err(PollingError::BudgetExhausted {
                        batch,
                        polls,
                        outstanding: active.len() + pending.len(),
                    }
                    .into());
                }
            }
            tokio::time::sleep(self.config.polling.interval()).await;
        }

        info!(
            session = %self.session,
            batch,
            completed,
            failed,
            "batch finished"
        );
        self.emit(ExperimentEvent::BatchFinished {
            batch,
            completed,
            failed,
        });
        Ok(self.registry.jobs_in_batch(batch).await?)
    }
}
