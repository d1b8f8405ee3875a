use crate::{
    config::ExecutionLimits,
    engine::{CodeRunner, RunnerCapabilities},
    errors::render_violations,
    host::{ExecutionHost, LivenessGuard},
    policy::{ExecutionRequest, ValidationVerdict},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a program invocation ended. Exactly one applies; callers match on
/// this instead of reading stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Ok,
    NonZero(i32),
    TimedOut,
    ValidationRejected,
    HostUnavailable,
}

impl ExitStatus {
    /// True when the program actually ran, whatever its exit
    pub fn ran(&self) -> bool {
        matches!(
            self,
            ExitStatus::Ok | ExitStatus::NonZero(_) | ExitStatus::TimedOut
        )
    }
}

/// Terminal value of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: ExitStatus,
    /// Output hit the byte cap and was cut
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn host_unavailable(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.into(),
            exit_status: ExitStatus::HostUnavailable,
            truncated: false,
            elapsed_ms: 0,
        }
    }

    /// Result reported for code that was never run
    pub fn rejected(verdict: &ValidationVerdict) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!(
                "Code validation failed:\n{}",
                render_violations(verdict.violations())
            ),
            exit_status: ExitStatus::ValidationRejected,
            truncated: false,
            elapsed_ms: 0,
        }
    }
}

/// Runs admitted programs on an execution host with a hard deadline and
/// an output cap
pub struct Runner {
    host: Arc<dyn ExecutionHost>,
    guard: LivenessGuard,
    limits: ExecutionLimits,
}

impl Runner {
    pub fn new(
        host: Arc<dyn ExecutionHost>,
        guard: LivenessGuard,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            host,
            guard,
            limits,
        }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Run with explicit bounds instead of the configured ones
    pub async fn run_with_limits(
        &self,
        request: &ExecutionRequest,
        limits: &ExecutionLimits,
    ) -> ExecutionResult {
        if let Err(e) = self.guard.ensure_ready(self.host.as_ref()).await {
            return ExecutionResult::host_unavailable(e.to_string());
        }

        let marker = format!("pyanalyst-{}", Uuid::new_v4().simple());
        let mut cmd = self.host.program_command(request.code(), limits, &marker);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_process_group(&mut cmd);

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("[RUNNER] Failed to spawn on {}: {}", self.host.identity(), e);
                return ExecutionResult::host_unavailable(format!(
                    "failed to start program on {}: {}",
                    self.host.identity(),
                    e
                ));
            }
        };
        let group = ProcessGroup::new(child.id());
        let cleanup = HostCleanup::new(self.host.clone(), marker);
        debug!("[RUNNER] Spawned pid {:?} on {}", child.id(), self.host.identity());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let budget = OutputBudget::new(limits.max_output_bytes);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let outcome = tokio::time::timeout(limits.timeout, async {
            let (out, err) = tokio::join!(
                drain_capped(stdout_pipe, &mut stdout_buf, &budget, &group),
                drain_capped(stderr_pipe, &mut stderr_buf, &budget, &group),
            );
            let truncated = out? | err?;
            if truncated {
                let _ = child.start_kill();
                cleanup.terminate().await;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, truncated))
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let stdout = decode_output(&stdout_buf);
        let stderr = decode_output(&stderr_buf);

        match outcome {
            Ok(Ok((status, truncated))) => {
                group.disarm();
                cleanup.disarm();
                let exit_status = match exit_code(&status) {
                    0 => ExitStatus::Ok,
                    code => ExitStatus::NonZero(code),
                };
                if truncated {
                    warn!(
                        "[RUNNER] Output exceeded {} bytes, truncated",
                        limits.max_output_bytes
                    );
                }
                info!(
                    "[RUNNER] Program finished: {:?} in {}ms",
                    exit_status, elapsed_ms
                );
                ExecutionResult {
                    stdout,
                    stderr,
                    exit_status,
                    truncated,
                    elapsed_ms,
                }
            }
            Ok(Err(e)) => {
                group.kill();
                let _ = child.start_kill();
                let _ = child.wait().await;
                cleanup.terminate().await;
                error!("[RUNNER] Lost contact with program: {}", e);
                ExecutionResult {
                    stdout,
                    stderr: format!("lost contact with program: {}", e),
                    exit_status: ExitStatus::HostUnavailable,
                    truncated: false,
                    elapsed_ms,
                }
            }
            Err(_) => {
                // Timeout - kill process group, then whatever the host kept
                group.kill();
                let _ = child.start_kill();
                let _ = child.wait().await;
                cleanup.terminate().await;
                warn!("[RUNNER] Program exceeded {:?}, killed", limits.timeout);
                ExecutionResult {
                    stdout,
                    stderr,
                    exit_status: ExitStatus::TimedOut,
                    truncated: budget.exhausted(),
                    elapsed_ms,
                }
            }
        }
    }
}

#[async_trait]
impl CodeRunner for Runner {
    async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.run_with_limits(request, &self.limits).await
    }

    async fn is_alive(&self) -> bool {
        self.host.is_alive().await
    }

    fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities {
            host: self.host.identity().to_string(),
            timeout_ms: self.limits.timeout.as_millis() as u64,
            max_output_bytes: self.limits.max_output_bytes,
        }
    }
}

/// Byte allowance shared by stdout and stderr
struct OutputBudget {
    remaining: AtomicUsize,
}

impl OutputBudget {
    fn new(max: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(max),
        }
    }

    /// Reserve up to `want` bytes, returning how many were granted
    fn take(&self, want: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                granted = want.min(left);
                Some(left - granted)
            });
        granted
    }

    fn exhausted(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) == 0
    }
}

/// Read a pipe into `sink` until EOF. Past the budget the program is
/// killed and the rest is discarded, so the writer never blocks on a full
/// pipe. Returns true when output was cut.
async fn drain_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    sink: &mut Vec<u8>,
    budget: &OutputBudget,
    group: &ProcessGroup,
) -> std::io::Result<bool> {
    let Some(mut reader) = reader else {
        return Ok(false);
    };
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(truncated);
        }
        if truncated {
            continue;
        }
        let granted = budget.take(n);
        sink.extend_from_slice(&chunk[..granted]);
        if granted < n {
            truncated = true;
            group.kill();
        }
    }
}

/// Lossy UTF-8, trimmed, never longer than the raw bytes it came from
fn decode_output(bytes: &[u8]) -> String {
    let valid = match std::str::from_utf8(bytes) {
        Ok(_) => bytes,
        // cut mid-character by the cap
        Err(e) if e.error_len().is_none() => &bytes[..e.valid_up_to()],
        Err(_) => bytes,
    };
    let mut text = String::from_utf8_lossy(valid).into_owned();
    if text.len() > bytes.len() {
        let mut end = bytes.len();
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text.trim().to_string()
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Put the program in its own process group so everything it spawned can
/// be killed together
#[cfg(unix)]
fn apply_process_group(cmd: &mut tokio::process::Command) {
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_group(_cmd: &mut tokio::process::Command) {}

/// Kills the program's process group on drop unless disarmed, so a
/// cancelled request does not leave the program running
struct ProcessGroup {
    // 0 once killed or disarmed
    pid: AtomicU32,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid: AtomicU32::new(pid.unwrap_or(0)),
        }
    }

    fn kill(&self) {
        let pid = self.pid.swap(0, Ordering::SeqCst);
        #[cfg(unix)]
        {
            if pid != 0 {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }

    fn disarm(&self) {
        self.pid.store(0, Ordering::SeqCst);
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Asks the host to kill the tagged invocation. Killing the local client
/// does not reach a program running inside a container.
struct HostCleanup {
    host: Arc<dyn ExecutionHost>,
    marker: String,
    armed: AtomicBool,
}

impl HostCleanup {
    fn new(host: Arc<dyn ExecutionHost>, marker: String) -> Self {
        Self {
            host,
            marker,
            armed: AtomicBool::new(true),
        }
    }

    async fn terminate(&self) {
        self.armed.store(false, Ordering::SeqCst);
        if let Err(e) = self.host.terminate(&self.marker).await {
            warn!("[RUNNER] Could not terminate {} in host: {}", self.marker, e);
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl Drop for HostCleanup {
    fn drop(&mut self) {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        // dropped mid-run: the request was cancelled
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let host = self.host.clone();
        let marker = std::mem::take(&mut self.marker);
        handle.spawn(async move {
            if let Err(e) = host.terminate(&marker).await {
                warn!("[RUNNER] Could not terminate {} in host: {}", marker, e);
            }
        });
    }
}
