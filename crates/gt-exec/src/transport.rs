//! Command transport — runs commands and stages files on the local host or a
//! remote host over SSH.
//!
//! All backends go through [`Transport`]: the direct scheduler spawns
//! simulations with it, the batch scheduler submits and polls through it, and
//! the driver stages input files with it. Exit codes are always surfaced;
//! nothing is retried unless the caller asks for retries explicitly.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use gt_types::{PortForward, RemoteConfig, TransportError};
use tokio::process::Command;
use tracing::{debug, warn};

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Captured result of one executed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Which side of a transfer is remote when copying files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Both endpoints live on the host the transport targets.
    Within,
    /// Local path to remote path.
    Push,
    /// Remote path to local path.
    Pull,
}

/// Runs commands locally or on a remote host.
///
/// Local mode hands commands to `sh -c`; remote mode wraps them in
/// `ssh user@host '...'` and stages files with `scp`.
#[derive(Debug, Clone)]
pub struct Transport {
    remote: Option<RemoteConfig>,
}

impl Transport {
    /// Transport that runs everything on the local host.
    pub fn local() -> Self {
        Self { remote: None }
    }

    /// Transport that runs everything on `remote` over SSH.
    pub fn remote(remote: RemoteConfig) -> Self {
        Self {
            remote: Some(remote),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Run a shell command and capture its exit code and output.
    pub async fn run(&self, command: &str) -> TransportResult<CommandOutput> {
        debug!(command, remote = self.is_remote(), "running command");
        let output = self
            .shell_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let exit_code = match output.status.code() {
            Some(code) => code,
            None => {
                return Err(TransportError::Signalled {
                    command: command.to_string(),
                })
            }
        };

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a command and treat a non-zero exit as an error.
    pub async fn run_checked(&self, command: &str) -> TransportResult<CommandOutput> {
        let output = self.run(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(TransportError::NonZeroExit {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Run a command, retrying failures up to `retries` additional times with
    /// `delay` between attempts. The last error is returned unchanged when
    /// every attempt fails.
    pub async fn run_with_retries(
        &self,
        command: &str,
        retries: u32,
        delay: Duration,
    ) -> TransportResult<CommandOutput> {
        let mut attempt = 0;
        loop {
            match self.run_checked(command).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    attempt += 1;
                    if attempt > retries {
                        return Err(err);
                    }
                    warn!(command, attempt, max = retries, error = %err, "retrying command");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Start `command` detached from this process, redirecting its output to
    /// `log_path`, and return the child pid.
    pub async fn spawn_detached(&self, command: &str, log_path: &Path) -> TransportResult<u32> {
        let wrapper = format!(
            "nohup {command} > {log} 2>&1 & echo $!",
            log = log_path.display()
        );
        let output = self.run_checked(&wrapper).await?;
        let pid_text = output.stdout.trim();
        pid_text
            .parse::<u32>()
            .map_err(|_| TransportError::MalformedOutput {
                command: command.to_string(),
                message: format!("expected a pid, got {pid_text:?}"),
            })
    }

    /// Copy a file or directory. Local transports always use `cp -r`; remote
    /// transports pick `scp`/`ssh cp` based on `direction`.
    pub async fn copy(
        &self,
        from: &Path,
        to: &Path,
        direction: CopyDirection,
    ) -> TransportResult<()> {
        let mut cmd = match (&self.remote, direction) {
            (None, _) => {
                let mut c = Command::new("cp");
                c.arg("-r").arg(from).arg(to);
                c
            }
            (Some(remote), CopyDirection::Within) => {
                let mut c = Command::new("ssh");
                c.arg(remote.destination())
                    .arg(format!("cp -r {} {}", from.display(), to.display()));
                c
            }
            (Some(remote), CopyDirection::Push) => {
                let mut c = Command::new("scp");
                c.arg("-r")
                    .arg(from)
                    .arg(format!("{}:{}", remote.destination(), to.display()));
                c
            }
            (Some(remote), CopyDirection::Pull) => {
                let mut c = Command::new("scp");
                c.arg("-r")
                    .arg(format!("{}:{}", remote.destination(), from.display()))
                    .arg(to);
                c
            }
        };

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                command: "cp/scp".to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::CopyFailed {
                from: from.display().to_string(),
                to: to.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Open a background SSH port forward. No-op for local transports; the
    /// tunnel stays up until [`Transport::close_port_forward`].
    pub async fn open_port_forward(&self, forward: PortForward) -> TransportResult<()> {
        let remote = match &self.remote {
            Some(remote) => remote,
            None => return Ok(()),
        };
        let spec = forward_spec(forward);
        debug!(forward = %spec, host = %remote.host, "opening port forward");

        let command = format!("ssh -fN -L {spec} {}", remote.destination());
        let output = self
            .local_shell(&command)
            .await
            .map_err(|source| TransportError::Spawn {
                command: command.clone(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::NonZeroExit {
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Tear down a previously opened port forward. Succeeds when no matching
    /// tunnel is running.
    pub async fn close_port_forward(&self, forward: PortForward) -> TransportResult<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        // pkill exits 1 when nothing matched; both outcomes mean "closed".
        let command = format!("pkill -f 'ssh -fN -L {}'", forward_spec(forward));
        let _ = self
            .local_shell(&command)
            .await
            .map_err(|source| TransportError::Spawn { command, source })?;
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn shell_command(&self, command: &str) -> Command {
        match &self.remote {
            Some(remote) => {
                let mut cmd = Command::new("ssh");
                cmd.arg(remote.destination()).arg(command);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
        }
    }

    /// Run on the local host even when the transport itself is remote (tunnel
    /// management lives on the local side).
    async fn local_shell(&self, command: &str) -> std::io::Result<std::process::Output> {
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }
}

fn forward_spec(forward: PortForward) -> String {
    format!("{}:localhost:{}", forward.local_port, forward.remote_port)
}
