//! Execution primitives for Gantry schedulers.
//!
//! Provides:
//! - Local and SSH command transport with file copy and port forwarding
//! - Container sandboxing for jobs that run inside Singularity images
//! - Input-file templating from parameter sets
//! - CSV post-processing of solver output

pub mod container;
pub mod postprocess;
pub mod template;
pub mod transport;

pub use container::{ContainerResult, ContainerSandbox};
pub use postprocess::{CsvColumnReader, PostProcessResult, PostProcessor};
pub use template::{InputTemplater, PlaceholderTemplater, TemplateResult};
pub use transport::{CommandOutput, CopyDirection, Transport, TransportResult};
