use crate::config::{ExecutionLimits, HostConfig};
use crate::errors::{AnalystError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// The three operations the core needs from an execution host
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Name the host is looked up by
    fn identity(&self) -> &str;

    /// Liveness check. Must not change host state.
    async fn is_alive(&self) -> bool;

    /// Start the host. Starting a running host is a no-op.
    async fn start(&self) -> Result<()>;

    /// Command running `code` as a single interpreter process inside the
    /// host. The runner owns spawning, deadlines, and output capture.
    /// `marker` tags the invocation so [`terminate`](Self::terminate) can
    /// find it again.
    fn program_command(&self, code: &str, limits: &ExecutionLimits, marker: &str) -> Command;

    /// Kill whatever the invocation tagged with `marker` left running inside
    /// the host. Hosts whose programs die with the local process need
    /// nothing here.
    async fn terminate(&self, _marker: &str) -> Result<()> {
        Ok(())
    }
}

/// Externally managed Docker container reached through `docker exec`
pub struct DockerHost {
    docker: PathBuf,
    container_name: String,
    start_command: Vec<String>,
    interpreter: String,
    control_timeout: Duration,
}

impl DockerHost {
    /// Create a host handle (finds docker in PATH)
    pub fn new(config: &HostConfig) -> Result<Self> {
        let docker = which::which("docker").map_err(|_| {
            AnalystError::HostUnavailable("docker CLI not found in PATH".to_string())
        })?;
        Ok(Self::with_docker_path(docker, config))
    }

    /// Create with explicit docker binary path
    pub fn with_docker_path(docker: PathBuf, config: &HostConfig) -> Self {
        Self {
            docker,
            container_name: config.container_name.clone(),
            start_command: config.start_command.clone(),
            interpreter: config.interpreter.clone(),
            control_timeout: config.control_timeout,
        }
    }

    fn terminate_command(&self, marker: &str) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("exec")
            .arg(&self.container_name)
            .arg("pkill")
            .arg("-KILL")
            .arg("-f")
            .arg(marker);
        cmd
    }

    /// Run a host-control command to completion within `control_timeout`
    async fn control(&self, mut cmd: Command, what: &str) -> Result<std::process::Output> {
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        match tokio::time::timeout(self.control_timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(AnalystError::HostUnavailable(format!(
                "failed to run {}: {}",
                what, e
            ))),
            Err(_) => Err(AnalystError::HostUnavailable(format!(
                "{} did not finish within {:?}",
                what, self.control_timeout
            ))),
        }
    }
}

#[async_trait]
impl ExecutionHost for DockerHost {
    fn identity(&self) -> &str {
        &self.container_name
    }

    async fn is_alive(&self) -> bool {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("ps")
            .arg("--filter")
            .arg(format!("name={}", self.container_name))
            .arg("--format")
            .arg("{{.Names}}");

        match self.control(cmd, "docker ps").await {
            Ok(output) if output.status.success() => {
                // the name filter is a substring match, require an exact line
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .any(|line| line.trim() == self.container_name)
            }
            Ok(output) => {
                warn!(
                    "[HOST] docker ps failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                error!("[HOST] Error checking container status: {}", e);
                false
            }
        }
    }

    async fn start(&self) -> Result<()> {
        let Some((program, args)) = self.start_command.split_first() else {
            return Err(AnalystError::HostUnavailable(
                "no start command configured".to_string(),
            ));
        };

        info!("[HOST] Starting execution host: {}", self.start_command.join(" "));
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = self.control(cmd, "start command").await?;

        if !output.status.success() {
            return Err(AnalystError::HostUnavailable(format!(
                "start command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn program_command(&self, code: &str, limits: &ExecutionLimits, marker: &str) -> Command {
        // in-container deadline in case terminate never reaches the host
        let deadline = limits.timeout.as_secs().max(1) + 1;
        let mut cmd = Command::new(&self.docker);
        cmd.arg("exec")
            .arg(&self.container_name)
            .arg("timeout")
            .arg("-s")
            .arg("KILL")
            .arg(deadline.to_string())
            .arg(&self.interpreter)
            .arg("-c")
            .arg(code)
            // lands in the interpreter's argv, where pkill -f finds it
            .arg(marker);
        cmd
    }

    async fn terminate(&self, marker: &str) -> Result<()> {
        let output = self
            .control(self.terminate_command(marker), "docker exec pkill")
            .await?;
        // pkill exits 1 when nothing matched, which is fine
        match output.status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(AnalystError::HostUnavailable(format!(
                "terminate failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Interpreter on this machine; always considered running
pub struct LocalHost {
    interpreter: PathBuf,
    identity: String,
}

impl LocalHost {
    /// Create with the interpreter named in the config (looked up in PATH)
    pub fn new(config: &HostConfig) -> Result<Self> {
        let interpreter = which::which(&config.interpreter)
            .or_else(|_| which::which("python3"))
            .or_else(|_| which::which("python"))
            .map_err(|_| {
                AnalystError::HostUnavailable(format!(
                    "interpreter '{}' not found in PATH",
                    config.interpreter
                ))
            })?;
        Ok(Self::with_interpreter(interpreter))
    }

    /// Create with explicit interpreter path
    pub fn with_interpreter(interpreter: PathBuf) -> Self {
        let identity = format!("local:{}", interpreter.display());
        Self {
            interpreter,
            identity,
        }
    }
}

#[async_trait]
impl ExecutionHost for LocalHost {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn is_alive(&self) -> bool {
        self.interpreter.exists()
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    fn program_command(&self, code: &str, _limits: &ExecutionLimits, marker: &str) -> Command {
        // the process group kill covers local programs; the marker is argv only
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c")
            .arg(code)
            .arg(marker)
            .env("PYTHONIOENCODING", "utf-8");
        cmd
    }
}

/// Makes sure the host answers before a program is sent to it.
///
/// One start attempt per call, no retry loop: a host that stays down is
/// reported, not papered over.
#[derive(Debug, Clone)]
pub struct LivenessGuard {
    grace: Duration,
}

impl LivenessGuard {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Returns `HostUnavailable` if the host is still down after one start
    /// and the grace interval. Not cancellable mid-wait in any useful way;
    /// the wait is short and bounded.
    pub async fn ensure_ready(&self, host: &dyn ExecutionHost) -> Result<()> {
        if host.is_alive().await {
            return Ok(());
        }

        info!("[HOST] {} is not running, attempting one start", host.identity());
        if let Err(e) = host.start().await {
            error!("[HOST] Failed to start {}: {}", host.identity(), e);
            return Err(AnalystError::HostUnavailable(format!(
                "{} is not running and could not be started",
                host.identity()
            )));
        }

        tokio::time::sleep(self.grace).await;

        if host.is_alive().await {
            info!("[HOST] {} started", host.identity());
            Ok(())
        } else {
            error!("[HOST] {} still down after start", host.identity());
            Err(AnalystError::HostUnavailable(format!(
                "{} did not become ready within {:?}",
                host.identity(),
                self.grace
            )))
        }
    }
}
