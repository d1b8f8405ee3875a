//! Sandboxed execution orchestrator for a data-analysis agent.
//!
//! A question about an uploaded table goes to the model, the first fenced
//! program in the reply is checked against a deny-list, run inside an
//! externally managed execution host under a deadline and an output cap,
//! and its output goes back to the model for a prose answer.
//!
//! ```rust,ignore
//! use pyanalyst::{create_orchestrator, AnalysisRequest, AnalystConfig};
//!
//! let config = AnalystConfig::from_env();
//! let orchestrator = create_orchestrator(&config)?;
//! let outcome = orchestrator
//!     .analyze(AnalysisRequest::new("how many rows?", "3f2a9c1e"))
//!     .await;
//! println!("{:?}", outcome.result);
//! ```

pub mod builder;
pub mod config;
pub mod conversation;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod extractor;
pub mod files;
pub mod host;
pub mod model;
pub mod policy;
pub mod prompt;
pub mod runner;

pub use builder::{create_orchestrator, create_orchestrator_with_model, create_runner};
pub use config::{AnalystConfig, ExecutionLimits, HostConfig, HostKind, ModelConfig};
pub use conversation::{AnalysisRequest, ConversationTurn, Role};
pub use driver::{AnalysisOutcome, DriverState, HealthReport, Orchestrator};
pub use engine::{CodeRunner, RunnerCapabilities};
pub use errors::{AnalystError, ModelError, Result};
pub use extractor::{extract, CandidateCode, CodeExtractor};
pub use files::{FileStore, UploadsFileStore};
pub use host::{DockerHost, ExecutionHost, LivenessGuard, LocalHost};
pub use model::{AnthropicClient, ModelClient};
pub use policy::{ExecutionRequest, SafetyPolicy, ValidationVerdict, Violation};
pub use runner::{ExecutionResult, ExitStatus, Runner};
