use crate::policy::ExecutionRequest;
use crate::runner::ExecutionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a runner reports about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerCapabilities {
    /// Identity of the execution host
    pub host: String,
    /// Wall clock timeout per program
    pub timeout_ms: u64,
    /// Cap on combined stdout + stderr
    pub max_output_bytes: usize,
}

/// Trait for anything that can run an admitted program.
///
/// The orchestrator only sees this seam, so tests can substitute a runner
/// that records calls instead of spawning processes.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Execute one admitted program. Failures are reported in the result,
    /// never retried.
    async fn run(&self, request: &ExecutionRequest) -> ExecutionResult;

    /// Liveness of the underlying host, without attempting a start
    async fn is_alive(&self) -> bool;

    /// Get runner capabilities
    fn capabilities(&self) -> RunnerCapabilities;
}
