//! Job scheduling and monitoring for Gantry.
//!
//! Turns one "evaluate the model at this parameter vector" request into a
//! running external process and tracks it to completion:
//! - [`Scheduler`] — the uniform submit/poll contract over the backends
//! - [`DirectScheduler`], [`BatchScheduler`], [`TaskServiceScheduler`] —
//!   local processes, PBS/Slurm queues, and container-task services
//! - [`Driver`] — stages, launches, and harvests a single job
//! - [`ExperimentRunner`] — the caller-side submit-and-poll loop
//! - [`InMemoryRegistry`] — job storage for local experiments and tests

pub mod batch;
pub mod direct;
pub mod driver;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod task_service;

pub use batch::BatchScheduler;
pub use direct::DirectScheduler;
pub use driver::{Driver, DriverContext};
pub use registry::InMemoryRegistry;
pub use runner::{ExperimentEvent, ExperimentRunner, ExperimentStats};
pub use scheduler::{create_scheduler, BackendJobState, Scheduler};
pub use task_service::TaskServiceScheduler;
