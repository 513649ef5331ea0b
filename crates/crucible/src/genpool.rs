//! Parallel generator pool.
//!
//! Runs up to N generator configurations concurrently against the model
//! gateway, collects variants, and scores them by quality × speed.
//! Completion order is not stable and callers must not rely on it; the
//! scoring stage picks the winner. When the gateway is saturated and the
//! deadline would be missed, affected generators drop out and the pool
//! returns with fewer variants.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use foundry::EngineError;

use crate::gateway::{GatewayError, GenerateRequest, ModelGateway, ModelRole};
use crate::planner::TaskSpec;

/// One generator configuration.
#[derive(Debug, Clone)]
pub struct GenConfig {
    pub name: String,
    pub role: ModelRole,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub max_output: u32,
}

/// Default pool: varied temperature and role so variants actually differ.
pub fn default_generators(max_variants: usize) -> Vec<GenConfig> {
    let palette = [
        (ModelRole::Base, 0.1),
        (ModelRole::Base, 0.5),
        (ModelRole::Powerful, 0.2),
        (ModelRole::Base, 0.9),
        (ModelRole::Powerful, 0.7),
    ];
    palette
        .iter()
        .cycle()
        .take(max_variants)
        .enumerate()
        .map(|(i, (role, temperature))| GenConfig {
            name: format!("gen-{}-{i}", role.as_str()),
            role: *role,
            temperature: *temperature,
            seed: Some(i as u64),
            max_output: 4096,
        })
        .collect()
}

/// One produced variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub generator_name: String,
    /// Empty when the generator failed.
    pub source: String,
    pub gen_wall_ms: u64,
    pub ok: bool,
}

/// The pool.
pub struct GeneratorPool {
    gateway: Arc<ModelGateway>,
}

const GENERATOR_SYSTEM: &str = "You write one complete, self-contained program. \
It reads a single JSON document from stdin and writes a single JSON document \
to stdout with the primary value under `result`. No prose, no markdown fences \
unless they wrap the single program. Stay inside the stated caps.";

impl GeneratorPool {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Run the generators concurrently.
    ///
    /// Every generator failure is captured as a failed variant; the call
    /// errors only when cancellation fires or every generator failed.
    pub async fn generate(
        &self,
        request_id: &str,
        spec: &TaskSpec,
        generators: &[GenConfig],
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Vec<Variant>, EngineError> {
        let prompt = generation_prompt(spec);
        let mut in_flight: FuturesUnordered<_> = generators
            .iter()
            .cloned()
            .map(|config| {
                let gateway = Arc::clone(&self.gateway);
                let prompt = prompt.clone();
                let cancel = cancel.clone();
                let request_id = request_id.to_string();
                async move {
                    let start = Instant::now();
                    let request = GenerateRequest {
                        role: config.role,
                        system: Some(GENERATOR_SYSTEM.to_string()),
                        prompt,
                        temperature: config.temperature,
                        max_tokens: config.max_output,
                        seed: config.seed,
                    };
                    let result = gateway.generate(&request_id, &request, &cancel, deadline).await;
                    let gen_wall_ms = start.elapsed().as_millis() as u64;
                    (config, result, gen_wall_ms)
                }
            })
            .collect();

        let mut variants = Vec::with_capacity(generators.len());
        while let Some((config, result, gen_wall_ms)) = in_flight.next().await {
            match result {
                Ok(response) => {
                    let source = extract_code_block(&response.text);
                    debug!(generator = config.name.as_str(), gen_wall_ms, "variant ready");
                    variants.push(Variant {
                        generator_name: config.name,
                        source,
                        gen_wall_ms,
                        ok: true,
                    });
                }
                Err(GatewayError::Cancelled) => {
                    // Pending and in-flight work is released with us.
                    return Err(EngineError::CancelRequested("generator pool".into()));
                }
                Err(err) => {
                    warn!(generator = config.name.as_str(), error = %err, "generator failed");
                    variants.push(Variant {
                        generator_name: config.name,
                        source: String::new(),
                        gen_wall_ms,
                        ok: false,
                    });
                }
            }
        }

        if !variants.iter().any(|v| v.ok && !v.source.trim().is_empty()) {
            return Err(EngineError::AllGeneratorsFailed(format!(
                "{} generators, zero usable variants",
                generators.len()
            )));
        }
        Ok(variants)
    }
}

/// Combined selection score. Weights come from configuration.
pub fn combined_score(quality: f64, speed: f64, quality_weight: f64, speed_weight: f64) -> f64 {
    quality_weight * quality + speed_weight * speed
}

/// Normalized speed: the fastest variant scores 1.0, everything else its
/// fraction of the fastest wall time.
pub fn speed_score(gen_wall_ms: u64, fastest_ms: u64) -> f64 {
    if gen_wall_ms == 0 {
        return 1.0;
    }
    (fastest_ms.max(1) as f64 / gen_wall_ms as f64).clamp(0.0, 1.0)
}

/// Index of the best entry among `(quality, speed)` pairs.
pub fn select_best(scored: &[(f64, f64)], quality_weight: f64, speed_weight: f64) -> Option<usize> {
    scored
        .iter()
        .enumerate()
        .max_by(|(_, (qa, sa)), (_, (qb, sb))| {
            let a = combined_score(*qa, *sa, quality_weight, speed_weight);
            let b = combined_score(*qb, *sb, quality_weight, speed_weight);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx)
}

fn generation_prompt(spec: &TaskSpec) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Problem\n{}\n\n", spec.problem));
    if !spec.inputs.is_empty() {
        prompt.push_str("## Inputs\n");
        for field in &spec.inputs {
            prompt.push_str(&format!(
                "- `{}`: {}{}\n",
                field.name,
                field.ty,
                field
                    .constraints
                    .as_deref()
                    .map(|c| format!(" ({c})"))
                    .unwrap_or_default()
            ));
        }
        prompt.push('\n');
    }
    if !spec.outputs.is_empty() {
        prompt.push_str("## Outputs\n");
        for field in &spec.outputs {
            prompt.push_str(&format!("- `{}`: {}\n", field.name, field.ty));
        }
        prompt.push('\n');
    }
    if !spec.algorithm_sketch.trim().is_empty() {
        prompt.push_str(&format!("## Approach\n{}\n\n", spec.algorithm_sketch));
    }
    prompt.push_str(&format!(
        "## Caps\nwall_ms ≤ {}, iterations ≤ {}, sequence length ≤ {}\n",
        spec.resource_caps.wall_ms, spec.safety_caps.max_iterations, spec.safety_caps.max_sequence_len
    ));
    if !spec.success_criteria.is_empty() {
        prompt.push_str("\n## Success criteria\n");
        for criterion in &spec.success_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }
    prompt
}

/// Pull the program out of a fenced block when present; otherwise the
/// raw response is the program.
pub fn extract_code_block(text: &str) -> String {
    let Some(open) = text.find("```") else {
        return text.trim().to_string();
    };
    let after_fence = &text[open + 3..];
    // Skip the language tag line.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim_end().to_string() + "\n",
        None => body.trim().to_string(),
    }
}

/// Wall-clock slack the pool leaves for validation and testing.
pub fn generation_deadline(request_deadline: Instant) -> Instant {
    let remaining = request_deadline.saturating_duration_since(Instant::now());
    // Two thirds for generation, the rest for validate/test/evaluate.
    Instant::now() + remaining.mul_f64(0.66).max(Duration::from_millis(1))
}
