//! Static validator pipeline — ordered gates with bounded auto-fix.
//!
//! Validators run in priority order, highest first, stopping at the first
//! failure. When the failing validator offers an auto-fix, the patch is
//! applied and the pipeline re-runs from the top; total auto-fix attempts
//! per request are bounded. Execution is gated on every enabled validator
//! passing — a partial pass never reaches the test runner.
//!
//! Validators are CPU-bound and must not block on network; each declares
//! a wall-clock budget that is enforced after the fact (an over-budget
//! gate fails).

pub mod checks;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fixes::PatchTransform;

/// Outcome of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    Skipped,
}

/// A single diagnostic from a validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub code: String,
    pub text: String,
}

impl ValidatorMessage {
    pub fn new(line: Option<usize>, code: &str, text: impl Into<String>) -> Self {
        Self {
            line,
            code: code.to_string(),
            text: text.into(),
        }
    }
}

/// What a validator returns for one source.
#[derive(Debug, Clone)]
pub struct ValidatorOutcome {
    pub passed: bool,
    pub messages: Vec<ValidatorMessage>,
    /// Patch the pipeline may apply when `supports_autofix`.
    pub autofix_patch: Option<PatchTransform>,
}

impl ValidatorOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            messages: Vec::new(),
            autofix_patch: None,
        }
    }

    pub fn fail(messages: Vec<ValidatorMessage>) -> Self {
        Self {
            passed: false,
            messages,
            autofix_patch: None,
        }
    }

    pub fn fail_with_fix(messages: Vec<ValidatorMessage>, patch: PatchTransform) -> Self {
        Self {
            passed: false,
            messages,
            autofix_patch: Some(patch),
        }
    }
}

/// A static validator gate.
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> u32;
    fn category(&self) -> &str;
    fn supports_autofix(&self) -> bool {
        false
    }
    fn timeout_ms(&self) -> u64 {
        1_000
    }
    fn check(&self, source: &str) -> ValidatorOutcome;
}

/// Result of one gate in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub category: String,
    pub outcome: GateOutcome,
    pub messages: Vec<ValidatorMessage>,
    pub duration_ms: u64,
}

/// The full pipeline report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True only when every enabled validator passed.
    pub ok: bool,
    /// Gates from the final pass (earlier auto-fixed passes are dropped).
    pub gates: Vec<GateResult>,
    pub autofix_attempts: u32,
    /// Source after any applied auto-fixes.
    pub final_source: String,
}

impl ValidationReport {
    /// Messages of the first failing gate, for signature derivation.
    pub fn first_failure(&self) -> Option<&GateResult> {
        self.gates
            .iter()
            .find(|g| g.outcome == GateOutcome::Failed)
    }
}

/// Ordered validator pipeline.
pub struct ValidatorPipeline {
    validators: Vec<Box<dyn Validator>>,
    max_autofix_attempts: u32,
}

impl ValidatorPipeline {
    /// Build from validators; they are ordered by priority descending,
    /// name ascending on ties.
    pub fn new(mut validators: Vec<Box<dyn Validator>>, max_autofix_attempts: u32) -> Self {
        validators.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self {
            validators,
            max_autofix_attempts,
        }
    }

    pub fn validator_names(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Run the pipeline, applying bounded auto-fixes.
    pub fn validate(&self, source: &str) -> ValidationReport {
        let mut current = source.to_string();
        let mut attempts = 0u32;

        loop {
            let (gates, failure) = self.run_once(&current);
            let Some((patch, failed_name)) = failure else {
                return ValidationReport {
                    ok: true,
                    gates,
                    autofix_attempts: attempts,
                    final_source: current,
                };
            };

            let fixable = patch.and_then(|p| {
                if attempts < self.max_autofix_attempts {
                    p.apply(&current)
                } else {
                    None
                }
            });
            match fixable {
                Some(patched) => {
                    attempts += 1;
                    debug!(
                        validator = failed_name.as_str(),
                        attempt = attempts,
                        "auto-fix applied, re-running pipeline"
                    );
                    current = patched;
                }
                None => {
                    return ValidationReport {
                        ok: false,
                        gates,
                        autofix_attempts: attempts,
                        final_source: current,
                    };
                }
            }
        }
    }

    /// One pass over all gates, fail-fast. Returns the gates plus the
    /// failing validator's patch offer and name, when any failed.
    #[allow(clippy::type_complexity)]
    fn run_once(
        &self,
        source: &str,
    ) -> (Vec<GateResult>, Option<(Option<PatchTransform>, String)>) {
        let mut gates = Vec::with_capacity(self.validators.len());

        for (index, validator) in self.validators.iter().enumerate() {
            let start = Instant::now();
            let mut outcome = validator.check(source);
            let duration_ms = start.elapsed().as_millis() as u64;

            if duration_ms > validator.timeout_ms() {
                outcome = ValidatorOutcome::fail(vec![ValidatorMessage::new(
                    None,
                    "timeout",
                    format!(
                        "validator exceeded its {}ms budget ({duration_ms}ms)",
                        validator.timeout_ms()
                    ),
                )]);
            }

            let passed = outcome.passed;
            gates.push(GateResult {
                name: validator.name().to_string(),
                category: validator.category().to_string(),
                outcome: if passed {
                    GateOutcome::Passed
                } else {
                    GateOutcome::Failed
                },
                messages: outcome.messages,
                duration_ms,
            });

            if !passed {
                let patch = if validator.supports_autofix() {
                    outcome.autofix_patch
                } else {
                    None
                };
                let name = validator.name().to_string();
                // Remaining gates are skipped in this pass.
                for skipped in &self.validators[index + 1..] {
                    gates.push(GateResult {
                        name: skipped.name().to_string(),
                        category: skipped.category().to_string(),
                        outcome: GateOutcome::Skipped,
                        messages: Vec::new(),
                        duration_ms: 0,
                    });
                }
                return (gates, Some((patch, name)));
            }
        }

        (gates, None)
    }
}
