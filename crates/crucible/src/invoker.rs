//! Tool invocation.
//!
//! Executes a selected tool by its kind-specific recipe: LLM tools route
//! through the model gateway by role, executable tools run as bounded
//! subprocesses with the argument document on disk, workflow tools
//! compose steps sequentially (output of one feeds the next), and
//! OpenAPI tools make one HTTP call. The tool graph is acyclic by
//! construction; a depth cap guards against malformed descriptor sets.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use foundry::tools::Invocation;
use foundry::{EngineError, ToolDescriptor, ToolRegistry};

use crate::gateway::{GenerateRequest, ModelGateway, ModelRole};

/// Workflow nesting beyond this depth means the descriptor set has a
/// cycle or is degenerate.
const MAX_WORKFLOW_DEPTH: usize = 8;

/// Default wall clock for executable tool processes.
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ToolInvoker {
    gateway: Arc<ModelGateway>,
    registry: Arc<ToolRegistry>,
    http: reqwest::Client,
}

impl ToolInvoker {
    pub fn new(gateway: Arc<ModelGateway>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            gateway,
            registry,
            http: reqwest::Client::new(),
        }
    }

    /// Invoke a tool with a JSON argument document, returning its JSON
    /// result. `request_id` is the originating engine request.
    pub async fn invoke(
        &self,
        request_id: &str,
        tool: &ToolDescriptor,
        args: &serde_json::Value,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<serde_json::Value, EngineError> {
        self.invoke_at_depth(request_id, tool, args, cancel, deadline, 0)
            .await
    }

    fn invoke_at_depth<'a>(
        &'a self,
        request_id: &'a str,
        tool: &'a ToolDescriptor,
        args: &'a serde_json::Value,
        cancel: &'a CancellationToken,
        deadline: Instant,
        depth: usize,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<serde_json::Value, EngineError>> + Send + 'a>,
    > {
        Box::pin(async move {
            if depth > MAX_WORKFLOW_DEPTH {
                return Err(EngineError::ConstraintViolation(format!(
                    "workflow nesting exceeds {MAX_WORKFLOW_DEPTH} in tool '{}'",
                    tool.tool_id
                )));
            }
            debug!(tool = tool.tool_id.as_str(), kind = %tool.kind, depth, "invoking tool");
            match &tool.invocation {
                Invocation::Llm { role } => {
                    self.invoke_llm(request_id, role, args, cancel, deadline).await
                }
                Invocation::Executable { .. } => {
                    self.invoke_executable(tool, args, cancel, deadline).await
                }
                Invocation::Workflow { steps } => {
                    let snapshot = self.registry.snapshot();
                    let mut document = args.clone();
                    for step_id in steps {
                        let step = snapshot.get(step_id).ok_or_else(|| {
                            EngineError::Config(format!(
                                "workflow '{}' references unknown tool '{step_id}'",
                                tool.tool_id
                            ))
                        })?;
                        document = self
                            .invoke_at_depth(request_id, step, &document, cancel, deadline, depth + 1)
                            .await?;
                    }
                    Ok(document)
                }
                Invocation::Openapi { endpoint, method } => {
                    self.invoke_openapi(endpoint, method, args, cancel, deadline)
                        .await
                }
            }
        })
    }

    async fn invoke_llm(
        &self,
        request_id: &str,
        role: &str,
        args: &serde_json::Value,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<serde_json::Value, EngineError> {
        let role = parse_role(role)?;
        let prompt = args
            .get("prompt")
            .and_then(|p| p.as_str())
            .map(|p| p.to_string())
            .unwrap_or_else(|| args.to_string());
        let response = self
            .gateway
            .generate(
                request_id,
                &GenerateRequest {
                    role,
                    system: None,
                    prompt,
                    temperature: 0.2,
                    max_tokens: 2048,
                    seed: None,
                },
                cancel,
                deadline,
            )
            .await
            .map_err(EngineError::from)?;
        Ok(serde_json::json!({ "result": response.text }))
    }

    async fn invoke_executable(
        &self,
        tool: &ToolDescriptor,
        args: &serde_json::Value,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<serde_json::Value, EngineError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| EngineError::StorageUnavailable(format!("scratch dir: {e}")))?;
        let input_path = scratch.path().join("input.json");
        tokio::fs::write(&input_path, serde_json::to_vec(args).unwrap_or_default())
            .await
            .map_err(|e| EngineError::StorageUnavailable(format!("writing input: {e}")))?;

        let argv = tool
            .invocation
            .executable_argv(&input_path.display().to_string())
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "tool '{}' has an unparseable command template",
                    tool.tool_id
                ))
            })?;

        let wall = EXEC_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(scratch.path())
            .kill_on_drop(true);
        let output = tokio::select! {
            output = tokio::time::timeout(wall, command.output()) => match output {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(EngineError::BackendUnavailable {
                        backend: tool.tool_id.clone(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(EngineError::BackendUnavailable {
                        backend: tool.tool_id.clone(),
                        reason: format!("timed out after {wall:?}"),
                    })
                }
            },
            _ = cancel.cancelled() => {
                return Err(EngineError::CancelRequested("tool invocation".into()))
            }
        };

        if !output.status.success() {
            return Err(EngineError::BackendUnavailable {
                backend: tool.tool_id.clone(),
                reason: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).chars().take(256).collect::<String>()
                ),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| EngineError::BackendUnavailable {
            backend: tool.tool_id.clone(),
            reason: format!("non-JSON output: {e}"),
        })
    }

    async fn invoke_openapi(
        &self,
        endpoint: &str,
        method: &str,
        args: &serde_json::Value,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<serde_json::Value, EngineError> {
        let wall = deadline.saturating_duration_since(Instant::now());
        let request = match method.to_ascii_uppercase().as_str() {
            "GET" => self.http.get(endpoint).query(&flatten_query(args)),
            "POST" => self.http.post(endpoint).json(args),
            "PUT" => self.http.put(endpoint).json(args),
            "DELETE" => self.http.delete(endpoint).json(args),
            other => {
                return Err(EngineError::Config(format!(
                    "unsupported openapi method '{other}'"
                )))
            }
        }
        .timeout(wall);

        let response = tokio::select! {
            response = request.send() => response.map_err(|e| EngineError::BackendUnavailable {
                backend: endpoint.to_string(),
                reason: e.to_string(),
            })?,
            _ = cancel.cancelled() => {
                return Err(EngineError::CancelRequested("tool invocation".into()))
            }
        };
        if !response.status().is_success() {
            return Err(EngineError::BackendUnavailable {
                backend: endpoint.to_string(),
                reason: format!("HTTP {}", response.status().as_u16()),
            });
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::BackendUnavailable {
                backend: endpoint.to_string(),
                reason: format!("non-JSON response: {e}"),
            })
    }
}

fn parse_role(role: &str) -> Result<ModelRole, EngineError> {
    match role {
        "fast" => Ok(ModelRole::Fast),
        "base" => Ok(ModelRole::Base),
        "powerful" => Ok(ModelRole::Powerful),
        "god" => Ok(ModelRole::God),
        "embedding" => Ok(ModelRole::Embedding),
        other => Err(EngineError::Config(format!("unknown model role '{other}'"))),
    }
}

/// Top-level scalar fields become query parameters for GET calls.
fn flatten_query(args: &serde_json::Value) -> Vec<(String, String)> {
    let Some(object) = args.as_object() else {
        return Vec::new();
    };
    object
        .iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), rendered))
        })
        .collect()
}
