//! Repair cycle — signature derivation, patch mining, and escalation.
//!
//! The orchestrator drives the loop: cached fixes are tried before any
//! repair model, repair generation escalates through roles, and the
//! whole cycle shares one bounded budget. This module holds the
//! deterministic pieces of that loop.

use serde::{Deserialize, Serialize};

use foundry::fixes::{ErrorSignature, PatchTransform};
use foundry::runner::RunOutcome;
use foundry::validator::ValidationReport;
use foundry::{ErrorKind, Severity};

use crate::gateway::ModelRole;
use crate::planner::TaskSpec;

/// Bounded attempt budget shared across cached fixes and repair
/// generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairBudget {
    pub total: u32,
    pub used: u32,
}

impl RepairBudget {
    pub fn new(total: u32) -> Self {
        Self { total, used: 0 }
    }

    /// Take one attempt; false when the budget is spent.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.total {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.total
    }
}

/// Signature for a validator-pipeline failure.
pub fn signature_from_validation(report: &ValidationReport) -> Option<ErrorSignature> {
    let gate = report.first_failure()?;
    let kind = match gate.category.as_str() {
        "imports" => ErrorKind::Import,
        "syntax" => ErrorKind::Syntax,
        _ => ErrorKind::Validator,
    };
    let message = gate
        .messages
        .first()
        .map(|m| format!("{}: {}", m.code, m.text))
        .unwrap_or_else(|| gate.name.clone());
    let site = gate
        .messages
        .first()
        .and_then(|m| m.line)
        .map(|l| format!("line {l}"))
        .unwrap_or_default();
    Some(ErrorSignature::derive(kind, &message, &site))
}

/// Signature for a sandbox run failure.
pub fn signature_from_run(outcome: &RunOutcome, expected_mismatch: bool) -> ErrorSignature {
    let stderr = outcome.stderr_text();
    let kind = classify_run_failure(outcome, expected_mismatch, &stderr);
    let message = match kind {
        ErrorKind::Timeout => "wall clock limit exceeded".to_string(),
        ErrorKind::MemoryOverrun => "memory limit exceeded".to_string(),
        ErrorKind::WrongOutput => "output did not match the expected result".to_string(),
        _ => stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("nonzero exit with empty stderr")
            .to_string(),
    };
    let site = stderr
        .lines()
        .find(|l| l.trim_start().starts_with("File "))
        .unwrap_or("")
        .to_string();
    ErrorSignature::derive(kind, &message, &site)
}

fn classify_run_failure(outcome: &RunOutcome, expected_mismatch: bool, stderr: &str) -> ErrorKind {
    if outcome.timed_out {
        ErrorKind::Timeout
    } else if outcome.memory_exceeded {
        ErrorKind::MemoryOverrun
    } else if outcome.exit_code != 0 {
        if stderr.contains("ImportError") || stderr.contains("ModuleNotFoundError") {
            ErrorKind::Import
        } else if stderr.contains("SyntaxError") || stderr.contains("IndentationError") {
            ErrorKind::Syntax
        } else {
            ErrorKind::Runtime
        }
    } else if expected_mismatch {
        ErrorKind::WrongOutput
    } else {
        ErrorKind::Other
    }
}

/// Failure severity for quality demotion.
pub fn severity_from_run(outcome: &RunOutcome, expected_mismatch: bool) -> Severity {
    if outcome.timed_out || outcome.memory_exceeded {
        Severity::High
    } else if expected_mismatch && outcome.exit_code == 0 {
        Severity::Medium
    } else {
        Severity::Medium
    }
}

/// Mine a reusable patch from a broken→repaired pair: the first
/// contiguous block of changed lines, as a literal replacement.
///
/// Pure insertions and deletions are not mined — without an anchor the
/// replacement would be ambiguous on other sources.
pub fn derive_patch(broken: &str, repaired: &str) -> Option<PatchTransform> {
    let broken_lines: Vec<&str> = broken.lines().collect();
    let repaired_lines: Vec<&str> = repaired.lines().collect();

    let prefix = broken_lines
        .iter()
        .zip(&repaired_lines)
        .take_while(|(a, b)| a == b)
        .count();
    if prefix == broken_lines.len() && prefix == repaired_lines.len() {
        return None; // identical
    }

    let mut suffix = 0usize;
    while suffix < broken_lines.len() - prefix
        && suffix < repaired_lines.len() - prefix
        && broken_lines[broken_lines.len() - 1 - suffix]
            == repaired_lines[repaired_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_block = &broken_lines[prefix..broken_lines.len() - suffix];
    let new_block = &repaired_lines[prefix..repaired_lines.len() - suffix];
    if old_block.is_empty() || new_block.is_empty() {
        return None;
    }

    Some(PatchTransform::Replace {
        find: old_block.join("\n"),
        replace: new_block.join("\n"),
    })
}

/// Repair escalation: start one role up from the generator tier and walk
/// toward the most capable model.
pub fn escalation_roles(start: ModelRole) -> Vec<ModelRole> {
    let mut roles = vec![start];
    let mut current = start;
    while let Some(next) = current.escalate() {
        roles.push(next);
        current = next;
    }
    roles
}

/// Prompt for a repair generation attempt.
pub fn repair_prompt(spec: &TaskSpec, source: &str, error_context: &str, attempt: u32) -> String {
    format!(
        "# Broken program (attempt {attempt})\n```\n{source}\n```\n\n\
         # Observed failure\n{error_context}\n\n\
         # Task it must solve\n{}\n\n\
         Return the complete corrected program. Same stdio contract: one \
         JSON document in on stdin, one JSON document out on stdout with \
         the primary value under `result`.",
        spec.problem
    )
}
