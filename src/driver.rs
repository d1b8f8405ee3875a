//! Conversation driver: the two-turn generate, execute, interpret exchange.
//!
//! ```text
//!  Generate ──► Extract ──► Validate ──► Execute ──► Interpret ──► Done
//!                  │            │            │
//!                  │ no code    │ rejected   │ host unavailable
//!                  └────────────┴────────────┴─────────────────────► Done
//! ```
//!
//! States are visited strictly in order and never revisited. Nothing is
//! retried inside one request; a follow-up question is the retry.

use crate::{
    conversation::{AnalysisRequest, ConversationTurn},
    engine::{CodeRunner, RunnerCapabilities},
    errors::{AnalystError, ModelError, Result},
    extractor::{CandidateCode, CodeExtractor},
    files::FileStore,
    model::ModelClient,
    policy::SafetyPolicy,
    prompt,
    runner::{ExecutionResult, ExitStatus},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Stdout-less summaries fall back to this text
pub const SUMMARY_FALLBACK: &str = "Failed to generate summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Generate,
    Extract,
    Validate,
    Execute,
    Interpret,
    Done,
}

/// What one `analyze` call produced.
///
/// `path` records every state visited, ending in [`DriverState::Done`].
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub request_id: Uuid,
    pub path: Vec<DriverState>,
    pub result: Result<String>,
    /// Program that was extracted, if any
    pub code: Option<String>,
    /// Set whenever the Execute state was reached
    pub execution: Option<ExecutionResult>,
}

impl AnalysisOutcome {
    pub fn answer(&self) -> Option<&str> {
        self.result.as_deref().ok()
    }

    pub fn error(&self) -> Option<&AnalystError> {
        self.result.as_ref().err()
    }
}

/// Host report for the health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub alive: bool,
    #[serde(flatten)]
    pub capabilities: RunnerCapabilities,
}

/// Tracks the path through the state machine for one request
struct Trace {
    request_id: Uuid,
    path: Vec<DriverState>,
    code: Option<String>,
    execution: Option<ExecutionResult>,
}

impl Trace {
    fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            path: Vec::with_capacity(6),
            code: None,
            execution: None,
        }
    }

    fn enter(&mut self, state: DriverState) {
        debug!("[DRIVER] -> {:?}", state);
        self.path.push(state);
    }

    fn done(mut self, result: Result<String>) -> AnalysisOutcome {
        self.enter(DriverState::Done);
        AnalysisOutcome {
            request_id: self.request_id,
            path: self.path,
            result,
            code: self.code,
            execution: self.execution,
        }
    }
}

/// Top-level orchestrator. Holds no per-request state, so one instance can
/// serve concurrent requests.
pub struct Orchestrator {
    model: Arc<dyn ModelClient>,
    runner: Arc<dyn CodeRunner>,
    files: Arc<dyn FileStore>,
    policy: SafetyPolicy,
    extractor: CodeExtractor,
    system_prompt: String,
    max_tokens: u32,
    interpret_max_tokens: u32,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        runner: Arc<dyn CodeRunner>,
        files: Arc<dyn FileStore>,
        policy: SafetyPolicy,
        extractor: CodeExtractor,
    ) -> Self {
        let system_prompt =
            prompt::system_prompt(&policy.input_root().to_string_lossy(), extractor.tag());
        Self {
            model,
            runner,
            files,
            policy,
            extractor,
            system_prompt,
            max_tokens: 4096,
            interpret_max_tokens: 2048,
        }
    }

    /// Token budgets for the generate and interpret calls
    pub fn with_token_budgets(mut self, generate: u32, interpret: u32) -> Self {
        self.max_tokens = generate;
        self.interpret_max_tokens = interpret;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Answer one question about one file
    pub async fn analyze(&self, request: AnalysisRequest) -> AnalysisOutcome {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("analysis", request_id = %request_id);
        self.drive(request, Trace::new(request_id))
            .instrument(span)
            .await
    }

    async fn drive(&self, request: AnalysisRequest, mut trace: Trace) -> AnalysisOutcome {
        let question = request.question.trim();
        if question.is_empty() {
            return trace.done(Err(AnalystError::MissingQuestion));
        }
        let data_path = match request.file_id.as_deref() {
            None => return trace.done(Err(AnalystError::MissingFile)),
            Some(id) => match self.files.resolve(id) {
                Ok(path) => path,
                Err(e) => return trace.done(Err(e)),
            },
        };
        info!(
            "[DRIVER] Analyzing {} with {} prior turns",
            data_path,
            request.history.len()
        );

        // Generate
        trace.enter(DriverState::Generate);
        let mut messages = request.history;
        messages.push(ConversationTurn::user(prompt::question_turn(
            &data_path, question,
        )));
        let generated = match self.call_model(&messages, self.max_tokens, "generate").await {
            Ok(text) => text,
            Err(e) => return trace.done(Err(e)),
        };

        // Extract
        trace.enter(DriverState::Extract);
        let Some(candidate) = self.extractor.extract(&generated) else {
            info!(
                "[DRIVER] No {} block in response, answering directly",
                self.extractor.tag()
            );
            return trace.done(Ok(generated));
        };
        trace.code = Some(candidate.body.clone());

        // Validate
        trace.enter(DriverState::Validate);
        let execution_request = match self.policy.admit(&candidate, &data_path) {
            Ok(req) => req,
            Err(verdict) => {
                return trace.done(Err(AnalystError::ValidationRejected(
                    verdict.into_violations(),
                )))
            }
        };

        // Execute
        trace.enter(DriverState::Execute);
        let result = self.runner.run(&execution_request).await;
        info!(
            "[DRIVER] Execution finished: {:?} in {}ms",
            result.exit_status, result.elapsed_ms
        );
        if result.exit_status == ExitStatus::HostUnavailable {
            let reason = result.stderr.clone();
            trace.execution = Some(result);
            return trace.done(Err(AnalystError::HostUnavailable(reason)));
        }

        // Interpret
        trace.enter(DriverState::Interpret);
        messages.push(ConversationTurn::assistant(generated));
        messages.push(ConversationTurn::user(prompt::results_turn(&result)));
        trace.execution = Some(result);
        let answer = self
            .call_model(&messages, self.interpret_max_tokens, "interpret")
            .await;
        trace.done(answer)
    }

    async fn call_model(
        &self,
        messages: &[ConversationTurn],
        max_tokens: u32,
        stage: &str,
    ) -> Result<String> {
        self.model
            .send(&self.system_prompt, messages, max_tokens)
            .await
            .map_err(|e: ModelError| {
                error!(
                    "[DRIVER] Model call failed during {} ({} messages): {:?}",
                    stage,
                    messages.len(),
                    e
                );
                AnalystError::ModelCall(e)
            })
    }

    /// Validate and run a program directly, without model calls.
    ///
    /// Rejected code comes back as a `ValidationRejected` result and is
    /// never executed.
    pub async fn execute_code(&self, code: &str, file_id: &str) -> Result<ExecutionResult> {
        let data_path = self.files.resolve(file_id)?;
        let candidate = CandidateCode {
            language_tag: self.extractor.tag().to_string(),
            body: code.to_string(),
        };
        match self.policy.admit(&candidate, &data_path) {
            Ok(request) => Ok(self.runner.run(&request).await),
            Err(verdict) => {
                warn!("[DRIVER] Direct execution refused");
                Ok(ExecutionResult::rejected(&verdict))
            }
        }
    }

    /// Overview of a dataset: row and column counts, dtypes, first rows
    pub async fn summarize(&self, file_id: &str) -> Result<String> {
        let data_path = self.files.resolve(file_id)?;
        let code = prompt::summary_program(&data_path);
        let result = self.execute_code(&code, file_id).await?;
        match result.exit_status {
            ExitStatus::HostUnavailable => Err(AnalystError::HostUnavailable(result.stderr)),
            _ if result.stdout.is_empty() => {
                warn!("[DRIVER] Summary produced no output: {:?}", result.exit_status);
                Ok(SUMMARY_FALLBACK.to_string())
            }
            _ => Ok(result.stdout),
        }
    }

    /// Host liveness and runner bounds. Never starts the host.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            alive: self.runner.is_alive().await,
            capabilities: self.runner.capabilities(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::files::UploadsFileStore;
    use crate::policy::ExecutionRequest;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One recorded model call
    #[derive(Debug, Clone)]
    pub(crate) struct ModelCall {
        pub messages: Vec<(String, String)>,
        pub max_tokens: u32,
    }

    /// Replays scripted responses in order
    pub(crate) struct FakeModel {
        responses: Mutex<VecDeque<std::result::Result<String, ModelError>>>,
        pub calls: Mutex<Vec<ModelCall>>,
    }

    impl FakeModel {
        pub fn new(responses: Vec<std::result::Result<String, ModelError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn replies(texts: &[&str]) -> Self {
            Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for FakeModel {
        async fn send(
            &self,
            _system_prompt: &str,
            messages: &[ConversationTurn],
            max_tokens: u32,
        ) -> std::result::Result<String, ModelError> {
            self.calls.lock().unwrap().push(ModelCall {
                messages: messages
                    .iter()
                    .map(|m| (m.role().as_str().to_string(), m.content().to_string()))
                    .collect(),
                max_tokens,
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::MalformedResponse("script exhausted".into())))
        }
    }

    /// Records every request and answers with a fixed result
    pub(crate) struct FakeRunner {
        result: ExecutionResult,
        pub runs: Mutex<Vec<(String, String)>>,
    }

    impl FakeRunner {
        pub fn new(result: ExecutionResult) -> Self {
            Self {
                result,
                runs: Mutex::new(Vec::new()),
            }
        }

        pub fn printing(stdout: &str) -> Self {
            Self::new(ExecutionResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_status: ExitStatus::Ok,
                truncated: false,
                elapsed_ms: 12,
            })
        }

        pub fn run_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CodeRunner for FakeRunner {
        async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
            self.runs
                .lock()
                .unwrap()
                .push((request.code().to_string(), request.data_path().to_string()));
            self.result.clone()
        }

        async fn is_alive(&self) -> bool {
            self.result.exit_status != ExitStatus::HostUnavailable
        }

        fn capabilities(&self) -> RunnerCapabilities {
            RunnerCapabilities {
                host: "fake-runner".to_string(),
                timeout_ms: 30_000,
                max_output_bytes: 1024,
            }
        }
    }

    fn orchestrator(model: Arc<FakeModel>, runner: Arc<FakeRunner>) -> Orchestrator {
        Orchestrator::new(
            model,
            runner,
            Arc::new(UploadsFileStore::new("/app/uploads", ".csv")),
            SafetyPolicy::new("/app/uploads"),
            CodeExtractor::new("python"),
        )
    }

    const COUNT_ROWS: &str = "Let me count.\n```python\nimport pandas as pd\ndf = pd.read_csv('/app/uploads/abc.csv')\nprint(len(df))\n```";

    use DriverState::*;

    #[tokio::test]
    async fn test_code_path_visits_every_state() {
        let model = Arc::new(FakeModel::replies(&[COUNT_ROWS, "The file has 3 rows."]));
        let runner = Arc::new(FakeRunner::printing("3"));
        let orch = orchestrator(model.clone(), runner.clone());

        let outcome = orch.analyze(AnalysisRequest::new("how many rows?", "abc")).await;

        assert_eq!(
            outcome.path,
            vec![Generate, Extract, Validate, Execute, Interpret, Done]
        );
        assert!(outcome.answer().unwrap().contains('3'));
        assert_eq!(runner.run_count(), 1);
        let (code, data_path) = runner.runs.lock().unwrap()[0].clone();
        assert!(code.starts_with("import pandas as pd"));
        assert_eq!(data_path, "/app/uploads/abc.csv");

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].max_tokens, 4096);
        assert_eq!(calls[1].max_tokens, 2048);
        let roles: Vec<&str> = calls[1].messages.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(calls[1].messages[1].1, COUNT_ROWS);
        assert!(calls[1].messages[2].1.contains("Stdout:\n3"));
    }

    #[tokio::test]
    async fn test_no_code_answers_with_raw_text() {
        let text = "A CSV file is a comma separated table.";
        let model = Arc::new(FakeModel::replies(&[text]));
        let runner = Arc::new(FakeRunner::printing("unused"));
        let orch = orchestrator(model.clone(), runner.clone());

        let outcome = orch.analyze(AnalysisRequest::new("what is a csv?", "abc")).await;

        assert_eq!(outcome.path, vec![Generate, Extract, Done]);
        assert_eq!(outcome.answer(), Some(text));
        assert_eq!(runner.run_count(), 0);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_code_is_never_run() {
        let model = Arc::new(FakeModel::replies(&[
            "```python\nimport os\nprint(os.listdir('/app/uploads'))\n```",
        ]));
        let runner = Arc::new(FakeRunner::printing("unused"));
        let orch = orchestrator(model.clone(), runner.clone());

        let outcome = orch.analyze(AnalysisRequest::new("list files", "abc")).await;

        assert_eq!(outcome.path, vec![Generate, Extract, Validate, Done]);
        match outcome.error() {
            Some(AnalystError::ValidationRejected(violations)) => {
                assert!(violations.iter().any(|v| v.pattern_id == "os-import"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(runner.run_count(), 0);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_host_skips_interpretation() {
        let model = Arc::new(FakeModel::replies(&[COUNT_ROWS, "never sent"]));
        let runner = Arc::new(FakeRunner::new(ExecutionResult::host_unavailable(
            "container did not come up",
        )));
        let orch = orchestrator(model.clone(), runner.clone());

        let outcome = orch.analyze(AnalysisRequest::new("how many rows?", "abc")).await;

        assert_eq!(outcome.path, vec![Generate, Extract, Validate, Execute, Done]);
        assert!(matches!(
            outcome.error(),
            Some(AnalystError::HostUnavailable(_))
        ));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_runs_are_still_interpreted() {
        let model = Arc::new(FakeModel::replies(&[COUNT_ROWS, "The column is missing."]));
        let runner = Arc::new(FakeRunner::new(ExecutionResult {
            stdout: "partial".to_string(),
            stderr: "KeyError: 'price'".to_string(),
            exit_status: ExitStatus::NonZero(1),
            truncated: false,
            elapsed_ms: 5,
        }));
        let orch = orchestrator(model.clone(), runner);

        let outcome = orch.analyze(AnalysisRequest::new("average price?", "abc")).await;

        assert_eq!(outcome.path.last(), Some(&Done));
        assert!(outcome.path.contains(&Interpret));
        assert_eq!(outcome.answer(), Some("The column is missing."));
        let calls = model.calls.lock().unwrap();
        assert!(calls[1].messages[2].1.contains("KeyError: 'price'"));
    }

    #[tokio::test]
    async fn test_model_failure_is_fatal() {
        let model = Arc::new(FakeModel::new(vec![Err(ModelError::Unauthorized(401))]));
        let runner = Arc::new(FakeRunner::printing("unused"));
        let orch = orchestrator(model, runner.clone());

        let outcome = orch.analyze(AnalysisRequest::new("how many rows?", "abc")).await;

        assert_eq!(outcome.path, vec![Generate, Done]);
        let err = outcome.error().unwrap();
        assert!(matches!(err, AnalystError::ModelCall(ModelError::Unauthorized(401))));
        assert_eq!(err.user_message(), "Analysis failed. Please try again.");
        assert_eq!(runner.run_count(), 0);
    }

    #[tokio::test]
    async fn test_second_model_failure_is_fatal() {
        let model = Arc::new(FakeModel::new(vec![
            Ok(COUNT_ROWS.to_string()),
            Err(ModelError::Unreachable("connection reset".to_string())),
        ]));
        let runner = Arc::new(FakeRunner::printing("3"));
        let orch = orchestrator(model, runner.clone());

        let outcome = orch.analyze(AnalysisRequest::new("how many rows?", "abc")).await;

        assert_eq!(
            outcome.path,
            vec![Generate, Extract, Validate, Execute, Interpret, Done]
        );
        assert!(matches!(outcome.error(), Some(AnalystError::ModelCall(_))));
        assert!(outcome.execution.is_some());
    }

    #[tokio::test]
    async fn test_missing_inputs_fail_before_generate() {
        let model = Arc::new(FakeModel::replies(&[]));
        let runner = Arc::new(FakeRunner::printing("unused"));
        let orch = orchestrator(model.clone(), runner);

        let outcome = orch.analyze(AnalysisRequest::new("   ", "abc")).await;
        assert_eq!(outcome.path, vec![Done]);
        assert!(matches!(outcome.error(), Some(AnalystError::MissingQuestion)));

        let mut request = AnalysisRequest::new("how many rows?", "abc");
        request.file_id = None;
        let outcome = orch.analyze(request).await;
        assert!(matches!(outcome.error(), Some(AnalystError::MissingFile)));

        let outcome = orch
            .analyze(AnalysisRequest::new("how many rows?", "../secrets"))
            .await;
        assert!(matches!(outcome.error(), Some(AnalystError::InvalidFileId(_))));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_history_precedes_new_question() {
        let model = Arc::new(FakeModel::replies(&["No code needed."]));
        let runner = Arc::new(FakeRunner::printing("unused"));
        let orch = orchestrator(model.clone(), runner);
        let history = vec![
            ConversationTurn::user("earlier question"),
            ConversationTurn::assistant("earlier answer"),
        ];

        orch.analyze(AnalysisRequest::new("follow up", "abc").with_history(history))
            .await;

        let calls = model.calls.lock().unwrap();
        let contents: Vec<&str> = calls[0].messages.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(contents[0], "earlier question");
        assert_eq!(contents[1], "earlier answer");
        assert!(contents[2].starts_with("The CSV file is located at: /app/uploads/abc.csv"));
        assert!(contents[2].ends_with("Question: follow up"));
    }

    #[tokio::test]
    async fn test_execute_code_refuses_rejected_program() {
        let runner = Arc::new(FakeRunner::printing("unused"));
        let orch = orchestrator(Arc::new(FakeModel::replies(&[])), runner.clone());

        let result = orch
            .execute_code("import subprocess\nsubprocess.run(['ls'])", "abc")
            .await
            .unwrap();

        assert_eq!(result.exit_status, ExitStatus::ValidationRejected);
        assert!(result.stderr.starts_with("Code validation failed:\n"));
        assert!(result.stderr.contains("[subprocess]"));
        assert_eq!(runner.run_count(), 0);

        let ok = orch.execute_code("print(1 + 2)", "abc").await.unwrap();
        assert_eq!(ok.stdout, "unused");
        assert_eq!(runner.run_count(), 1);
    }

    #[tokio::test]
    async fn test_summarize_uses_stdout_or_fallback() {
        let runner = Arc::new(FakeRunner::printing("Dataset Overview:\n- Rows: 3"));
        let orch = orchestrator(Arc::new(FakeModel::replies(&[])), runner.clone());
        let summary = orch.summarize("abc").await.unwrap();
        assert!(summary.starts_with("Dataset Overview:"));
        assert!(runner.runs.lock().unwrap()[0]
            .0
            .contains("pd.read_csv('/app/uploads/abc.csv')"));

        let silent = Arc::new(FakeRunner::printing(""));
        let orch = orchestrator(Arc::new(FakeModel::replies(&[])), silent);
        assert_eq!(orch.summarize("abc").await.unwrap(), SUMMARY_FALLBACK);
    }

    #[tokio::test]
    async fn test_health_reports_without_running() {
        let runner = Arc::new(FakeRunner::printing("unused"));
        let orch = orchestrator(Arc::new(FakeModel::replies(&[])), runner.clone());
        let report = orch.health().await;
        assert!(report.alive);
        assert_eq!(report.capabilities.host, "fake-runner");
        assert_eq!(runner.run_count(), 0);
    }
}
