//! Tracing setup and per-request metrics.
//!
//! Metrics accumulate during the orchestration loop and fold into the
//! execution record at the end; tracing carries the human-readable side.

use std::time::Instant;

use foundry::records::AttemptRecord;

use crate::gateway::ModelRole;

/// Initialize the global tracing subscriber. `RUST_LOG` wins; the
/// default level is info.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Accumulates attempt data and cost during one request.
pub struct RequestMetrics {
    started: Instant,
    attempts: Vec<AttemptRecord>,
    cost_units: f64,
    selected_tool: Option<String>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            attempts: Vec::new(),
            cost_units: 0.0,
            selected_tool: None,
        }
    }

    pub fn add_role_cost(&mut self, role: ModelRole) {
        self.cost_units += role.cost_units();
    }

    pub fn set_selected_tool(&mut self, tool_id: &str) {
        self.selected_tool = Some(tool_id.to_string());
    }

    pub fn record_attempt(
        &mut self,
        generator: &str,
        validators_ok: bool,
        test_pass: Option<bool>,
        evaluator_score: Option<f64>,
        latency_ms: u64,
    ) {
        self.attempts.push(AttemptRecord {
            generator: generator.to_string(),
            validators_ok,
            test_pass,
            evaluator_score,
            latency_ms,
        });
    }

    pub fn wall_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn cost_units(&self) -> f64 {
        self.cost_units
    }

    pub fn selected_tool(&self) -> Option<String> {
        self.selected_tool.clone()
    }

    pub fn into_attempts(self) -> Vec<AttemptRecord> {
        self.attempts
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_accumulate() {
        let mut metrics = RequestMetrics::new();
        metrics.add_role_cost(ModelRole::Base);
        metrics.add_role_cost(ModelRole::Powerful);
        metrics.record_attempt("gen-base-0", true, Some(true), Some(0.9), 120);
        metrics.set_selected_tool("tool-1");

        assert!((metrics.cost_units() - 5.0).abs() < 1e-9);
        assert_eq!(metrics.attempts().len(), 1);
        assert_eq!(metrics.selected_tool().as_deref(), Some("tool-1"));
    }
}
