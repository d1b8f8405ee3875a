use crate::{
    config::{AnalystConfig, HostConfig, HostKind},
    driver::Orchestrator,
    extractor::CodeExtractor,
    files::UploadsFileStore,
    host::{DockerHost, ExecutionHost, LivenessGuard, LocalHost},
    model::{AnthropicClient, ModelClient},
    policy::SafetyPolicy,
    runner::Runner,
    Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Pick the execution host named by the config.
///
/// A missing docker CLI is not fatal here: the host then reports itself
/// down on every request so callers get `HostUnavailable` instead of a
/// process that refuses to start.
pub fn create_host(config: &HostConfig) -> Result<Arc<dyn ExecutionHost>> {
    let host: Arc<dyn ExecutionHost> = match config.kind {
        HostKind::Docker => match DockerHost::new(config) {
            Ok(host) => Arc::new(host),
            Err(e) => {
                warn!("[HOST] {}; requests will report the host unavailable", e);
                Arc::new(DockerHost::with_docker_path(PathBuf::from("docker"), config))
            }
        },
        HostKind::Local => Arc::new(LocalHost::new(config)?),
    };
    info!(
        "[HOST] Using {} host: {}",
        config.kind.description(),
        host.identity()
    );
    Ok(host)
}

/// Runner for the configured host and limits
pub fn create_runner(config: &AnalystConfig) -> Result<Runner> {
    config.validate_execution()?;
    let host = create_host(&config.host)?;
    Ok(Runner::new(
        host,
        LivenessGuard::new(config.host.startup_grace),
        config.limits.clone(),
    ))
}

/// Safety policy confined to the configured input root
pub fn create_policy(config: &AnalystConfig) -> SafetyPolicy {
    SafetyPolicy::new(&config.input_root).with_blocked_modules(&config.blocked_modules)
}

/// Orchestrator with the Anthropic client. Fails with `Configuration` when
/// the credential is missing.
pub fn create_orchestrator(config: &AnalystConfig) -> Result<Orchestrator> {
    config.validate()?;
    let model: Arc<dyn ModelClient> = Arc::new(AnthropicClient::new(&config.model)?);
    create_orchestrator_with_model(config, model)
}

/// Orchestrator around a caller-supplied model client
pub fn create_orchestrator_with_model(
    config: &AnalystConfig,
    model: Arc<dyn ModelClient>,
) -> Result<Orchestrator> {
    let runner = Arc::new(create_runner(config)?);
    let files = Arc::new(UploadsFileStore::new(
        &config.input_root,
        &config.file_extension,
    ));
    Ok(Orchestrator::new(
        model,
        runner,
        files,
        create_policy(config),
        CodeExtractor::new(&config.code_tag),
    )
    .with_token_budgets(config.model.max_tokens, config.model.interpret_max_tokens))
}
