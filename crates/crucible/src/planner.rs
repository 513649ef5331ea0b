//! Overseer planner — turns a task into a structured, bounded spec.
//!
//! The plan names tools by abstract role, never by concrete model.
//! Resource caps start from configuration and can only tighten. Safety
//! caps bound every iterative dimension with explicit numbers; a spec
//! that blows past them is rejected before anything executes. Spec text
//! is bounded to twice the planning model's context window, truncated
//! head-and-tail with a marker.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use foundry::classifier::ReuseDecision;
use foundry::runner::ResourceLimits;
use foundry::truncate::truncate_preserving;
use foundry::{Artifact, EngineError};

use crate::gateway::{GenerateRequest, ModelGateway, ModelRole};

/// Numeric bounds on iterative work inside generated artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCaps {
    pub max_iterations: u64,
    pub max_sequence_len: u64,
    pub max_list_len: u64,
}

impl Default for SafetyCaps {
    fn default() -> Self {
        Self {
            max_iterations: 100_000,
            max_sequence_len: 100_000,
            max_list_len: 10_000,
        }
    }
}

impl SafetyCaps {
    fn validate(&self) -> Result<(), EngineError> {
        if self.max_iterations == 0 || self.max_sequence_len == 0 || self.max_list_len == 0 {
            return Err(EngineError::ConstraintViolation(
                "safety caps must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A typed field in the planned interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
}

/// One concrete test the runner will execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub input: serde_json::Value,
    /// Expected primary result; `None` means "any valid JSON output".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
}

/// The structured plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Capability namespace the artifact will live under.
    pub namespace: String,
    pub problem: String,
    pub inputs: Vec<SpecField>,
    pub outputs: Vec<SpecField>,
    pub algorithm_sketch: String,
    /// Abstract tool roles, resolved by the registry at call time.
    pub tools_needed: Vec<String>,
    pub resource_caps: ResourceLimits,
    pub safety_caps: SafetyCaps,
    pub success_criteria: Vec<String>,
    pub test_cases: Vec<TestCase>,
}

/// Model-facing payload; everything defaults so a sparse plan still
/// parses and gets validated afterwards.
#[derive(Debug, Default, Deserialize)]
struct PlannerPayload {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    problem: String,
    #[serde(default)]
    inputs: Vec<SpecField>,
    #[serde(default)]
    outputs: Vec<SpecField>,
    #[serde(default)]
    algorithm_sketch: String,
    #[serde(default)]
    tools_needed: Vec<String>,
    #[serde(default)]
    wall_ms: Option<u64>,
    #[serde(default)]
    mem_mb: Option<u64>,
    #[serde(default)]
    safety_caps: Option<SafetyCaps>,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    test_cases: Vec<TestCase>,
}

const PLANNER_SYSTEM: &str = "You are the overseer of a code-generation engine. \
Produce a single JSON object describing the plan. Fields: namespace (snake_case \
capability name), problem, inputs [{name, type, constraints}], outputs \
[{name, type}], algorithm_sketch, tools_needed (abstract role names only, \
never model names), wall_ms, mem_mb, safety_caps {max_iterations, \
max_sequence_len, max_list_len}, success_criteria [..], test_cases \
[{input, expected}]. The artifact reads one JSON document on stdin and \
writes one JSON document with a `result` field on stdout. Respond with \
JSON only.";

/// The overseer.
pub struct Overseer {
    gateway: Arc<ModelGateway>,
    default_caps: ResourceLimits,
}

impl Overseer {
    pub fn new(gateway: Arc<ModelGateway>, default_caps: ResourceLimits) -> Self {
        Self {
            gateway,
            default_caps,
        }
    }

    /// Produce a spec for a task. RELATED tasks must carry their
    /// reference; the plan is then expressed as a diff from it.
    pub async fn plan(
        &self,
        request_id: &str,
        task: &str,
        decision: ReuseDecision,
        reference: Option<&Artifact>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<TaskSpec, EngineError> {
        if decision == ReuseDecision::Related && reference.is_none() {
            return Err(EngineError::PlannerFailed(
                "related task without a reference artifact".into(),
            ));
        }

        let max_chars = (self.gateway.context_window(ModelRole::Powerful) as usize) * 2;
        let prompt = self.build_prompt(task, decision, reference, max_chars);

        // One retry with a smaller context on failure.
        let mut last_error = None;
        for (attempt, budget) in [(0u32, max_chars), (1, max_chars / 2)] {
            let request = GenerateRequest {
                role: ModelRole::Powerful,
                system: Some(PLANNER_SYSTEM.to_string()),
                prompt: truncate_preserving(&prompt, budget),
                temperature: 0.1,
                max_tokens: 4096,
                seed: None,
            };
            match self.gateway.generate(request_id, &request, cancel, deadline).await {
                Ok(response) => {
                    return self.parse_spec(&response.text, max_chars);
                }
                Err(
                    crate::gateway::GatewayError::Cancelled
                    | crate::gateway::GatewayError::DeadlineExceeded,
                ) => {
                    return Err(EngineError::CancelRequested("planner".into()));
                }
                Err(err) => {
                    // A failure with no time left is a cancellation, not a
                    // planner defect.
                    if cancel.is_cancelled() || Instant::now() >= deadline {
                        return Err(EngineError::CancelRequested("planner".into()));
                    }
                    warn!(attempt, error = %err, "planner model call failed");
                    last_error = Some(err);
                }
            }
        }
        Err(EngineError::PlannerFailed(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".into()),
        ))
    }

    fn build_prompt(
        &self,
        task: &str,
        decision: ReuseDecision,
        reference: Option<&Artifact>,
        max_chars: usize,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("# Task\n{task}\n\n"));
        if decision == ReuseDecision::Related {
            if let Some(reference) = reference {
                prompt.push_str(&format!(
                    "# Reference artifact (namespace `{}`)\n\
                     A close relative of this task already exists. Express the plan \
                     as a diff from it: keep what transfers, change what must change.\n\
                     ```\n{}\n```\n\n",
                    reference.namespace, reference.source
                ));
            }
        }
        prompt.push_str(&format!(
            "# Defaults\nwall_ms ≤ {}, mem_mb ≤ {}. Caps may only be lowered.\n",
            self.default_caps.wall_ms,
            self.default_caps.mem_mb.unwrap_or(512),
        ));
        truncate_preserving(&prompt, max_chars)
    }

    fn parse_spec(&self, response: &str, max_chars: usize) -> Result<TaskSpec, EngineError> {
        let json = extract_json_object(response)
            .ok_or_else(|| EngineError::PlannerFailed("no JSON object in response".into()))?;
        let payload: PlannerPayload = serde_json::from_str(&json)
            .map_err(|e| EngineError::PlannerFailed(format!("unparseable plan: {e}")))?;

        if payload.problem.trim().is_empty() {
            return Err(EngineError::PlannerFailed("plan has no problem statement".into()));
        }
        let namespace = normalize_namespace(&payload.namespace, &payload.problem);

        // Caps tighten only; a plan asking for more than the defaults
        // silently gets the defaults.
        let requested = ResourceLimits {
            wall_ms: payload.wall_ms.unwrap_or(self.default_caps.wall_ms),
            cpu_seconds: None,
            mem_mb: payload.mem_mb.or(self.default_caps.mem_mb),
            output_bytes: self.default_caps.output_bytes,
        };
        let resource_caps = self.default_caps.tightened(&requested);

        let safety_caps = payload.safety_caps.unwrap_or_default();
        safety_caps.validate()?;

        Ok(TaskSpec {
            namespace,
            problem: truncate_preserving(&payload.problem, max_chars),
            inputs: payload.inputs,
            outputs: payload.outputs,
            algorithm_sketch: truncate_preserving(&payload.algorithm_sketch, max_chars),
            tools_needed: payload.tools_needed,
            resource_caps,
            safety_caps,
            success_criteria: payload.success_criteria,
            test_cases: payload.test_cases,
        })
    }
}

/// First balanced `{...}` object in a model response, tolerating prose
/// and code fences around it.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Clean a namespace into snake_case, deriving one from the problem text
/// when the model omitted it.
fn normalize_namespace(namespace: &str, problem: &str) -> String {
    let source = if namespace.trim().is_empty() {
        problem
    } else {
        namespace
    };
    let cleaned: String = source
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let collapsed: Vec<&str> = cleaned.split('_').filter(|s| !s.is_empty()).collect();
    let name = collapsed.join("_");
    let mut out: String = name.chars().take(48).collect();
    if out.is_empty() {
        out = "unnamed_capability".into();
    }
    out
}
