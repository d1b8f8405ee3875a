use anyhow::Context;
use pyanalyst::{
    create_orchestrator, AnalysisOutcome, AnalysisRequest, AnalystConfig, AnalystError, HostKind,
    Orchestrator,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Default)]
struct WorkerArgs {
    config_path: Option<PathBuf>,
    host: Option<HostKind>,
    input_root: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl WorkerArgs {
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut parsed = Self {
            config_path: std::env::var("PYANALYST_CONFIG").ok().map(PathBuf::from),
            ..Default::default()
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    if let Some(v) = args.get(i + 1) {
                        parsed.config_path = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--host" => {
                    if let Some(v) = args.get(i + 1) {
                        match HostKind::parse(v) {
                            Some(kind) => parsed.host = Some(kind),
                            None => tracing::warn!("ignoring unknown --host value: {}", v),
                        }
                    }
                    i += 2;
                }
                "--input-root" => {
                    if let Some(v) = args.get(i + 1) {
                        parsed.input_root = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--timeout-secs" => {
                    if let Some(v) = args.get(i + 1) {
                        parsed.timeout = parse_timeout(v);
                        if parsed.timeout.is_none() {
                            tracing::warn!("ignoring invalid --timeout-secs value: {}", v);
                        }
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }
        parsed
    }

    fn load_config(&self) -> anyhow::Result<AnalystConfig> {
        let mut config = match &self.config_path {
            Some(path) => AnalystConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => AnalystConfig::from_env(),
        };
        if let Some(kind) = self.host {
            config.host.kind = kind;
        }
        if let Some(root) = &self.input_root {
            config.input_root = root.clone();
        }
        if let Some(timeout) = self.timeout {
            config.limits.timeout = timeout;
        }
        Ok(config)
    }
}

/// Positive, representable number of seconds
fn parse_timeout(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    code: String,
    #[serde(alias = "fileId")]
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct SummarizeParams {
    #[serde(alias = "fileId")]
    file_id: String,
}

enum Handled {
    Reply(Value),
    Shutdown(Value),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "pyanalyst=info,pyanalyst_worker=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = WorkerArgs::from_args();
    let config = args.load_config()?;
    let orchestrator = create_orchestrator(&config).context("failed to build orchestrator")?;
    tracing::info!(
        "pyanalyst-worker starting (host={}, input_root={})",
        config.host.kind.description(),
        config.input_root.display()
    );

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid request line: {} | err={}", line, e);
                continue;
            }
        };

        let (response, stop) = match handle_message(&orchestrator, parsed).await {
            Handled::Reply(v) => (v, false),
            Handled::Shutdown(v) => (v, true),
        };
        let s = serde_json::to_string(&response)?;
        stdout.write_all(s.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        if stop {
            tracing::info!("pyanalyst-worker shutting down");
            break;
        }
    }

    Ok(())
}

async fn handle_message(orchestrator: &Orchestrator, msg: Value) -> Handled {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned().unwrap_or(Value::Null);
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "analyze" => match serde_json::from_value::<AnalysisRequest>(params) {
            Ok(request) => outcome_to_json(orchestrator.analyze(request).await),
            Err(e) => Err(invalid_params(e)),
        },
        "execute" => match serde_json::from_value::<ExecuteParams>(params) {
            Ok(p) => orchestrator
                .execute_code(&p.code, &p.file_id)
                .await
                .map(|r| json!(r))
                .map_err(|e| error_object(&e)),
            Err(e) => Err(invalid_params(e)),
        },
        "summarize" => match serde_json::from_value::<SummarizeParams>(params) {
            Ok(p) => orchestrator
                .summarize(&p.file_id)
                .await
                .map(|summary| json!({ "summary": summary }))
                .map_err(|e| error_object(&e)),
            Err(e) => Err(invalid_params(e)),
        },
        "health" => Ok(json!(orchestrator.health().await)),
        "shutdown" => return Handled::Shutdown(json!({ "id": id, "result": null })),
        _ => Err(json!({
            "kind": "unknown_method",
            "message": format!("Method not found: {}", method),
            "status": 404
        })),
    };

    Handled::Reply(match result {
        Ok(v) => json!({ "id": id, "result": v }),
        Err(err_obj) => json!({ "id": id, "error": err_obj }),
    })
}

fn outcome_to_json(outcome: AnalysisOutcome) -> Result<Value, Value> {
    match &outcome.result {
        Ok(answer) => Ok(json!({
            "answer": answer,
            "request_id": outcome.request_id.to_string(),
            "path": outcome.path,
            "code": outcome.code,
            "execution": outcome.execution,
        })),
        Err(e) => {
            let mut err = error_object(e);
            err["request_id"] = json!(outcome.request_id.to_string());
            err["path"] = json!(outcome.path);
            Err(err)
        }
    }
}

fn error_object(e: &AnalystError) -> Value {
    json!({
        "kind": e.kind(),
        "message": e.user_message(),
        "status": e.status_code()
    })
}

fn invalid_params(e: serde_json::Error) -> Value {
    json!({
        "kind": "invalid_params",
        "message": format!("Invalid params: {}", e),
        "status": 400
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout_rejects_unrepresentable() {
        assert_eq!(parse_timeout("2.5"), Some(Duration::from_millis(2500)));
        assert_eq!(parse_timeout("1e30"), None);
        assert_eq!(parse_timeout("inf"), None);
        assert_eq!(parse_timeout("-3"), None);
        assert_eq!(parse_timeout("0"), None);
        assert_eq!(parse_timeout("soon"), None);
    }
}
