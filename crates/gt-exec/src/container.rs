//! Container sandbox — runs simulations inside Singularity/Apptainer images.

use std::path::Path;

use gt_types::{ContainerConfig, ContainerError};
use tracing::{debug, info};

use crate::transport::Transport;

/// Result alias for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Wraps job commands so they execute inside a container image, and makes
/// sure the image exists before the first job needs it.
#[derive(Debug, Clone)]
pub struct ContainerSandbox {
    config: ContainerConfig,
}

impl ContainerSandbox {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    pub fn image(&self) -> &Path {
        &self.config.image
    }

    /// Build or reuse the container image.
    ///
    /// Idempotent: when the image file already exists nothing happens. A
    /// build failure aborts the whole experiment, not just one job.
    pub async fn ensure_image_available(&self, transport: &Transport) -> ContainerResult<()> {
        let image = &self.config.image;
        let probe = format!("test -f {}", image.display());
        let present = transport
            .run(&probe)
            .await
            .map_err(|err| ContainerError::CommandFailed {
                message: err.to_string(),
            })?;
        if present.success() {
            debug!(image = %image.display(), "container image already present");
            return Ok(());
        }

        let definition = match &self.config.definition {
            Some(definition) => definition,
            None => {
                return Err(ContainerError::ImageMissing {
                    path: image.display().to_string(),
                })
            }
        };

        info!(
            image = %image.display(),
            definition = %definition.display(),
            "building container image"
        );
        let build = format!(
            "singularity build --force {} {}",
            image.display(),
            definition.display()
        );
        let output = transport
            .run(&build)
            .await
            .map_err(|err| ContainerError::CommandFailed {
                message: err.to_string(),
            })?;
        if output.success() {
            Ok(())
        } else {
            Err(ContainerError::BuildFailed {
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Rewrite `command` so it runs inside the image. Pure string transform;
    /// [`ContainerSandbox::strip_command`] undoes it.
    pub fn wrap_command(&self, command: &str) -> String {
        let image = self.config.image.display();
        if self.config.bind_paths.is_empty() {
            format!("singularity run {image} {command}")
        } else {
            let binds = self
                .config
                .bind_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            format!("singularity run --bind {binds} {image} {command}")
        }
    }

    /// Recover the original command from a wrapped one. Commands that were
    /// never wrapped come back unchanged.
    pub fn strip_command(&self, command: &str) -> String {
        let prefix = self.wrap_command("");
        match command.strip_prefix(&prefix) {
            Some(rest) => rest.to_string(),
            None => command.to_string(),
        }
    }
}
