//! Quality-score arithmetic.
//!
//! Quality increases only through passing test runs and decreases only
//! through measured failures. Deltas are bounded and the score is clamped
//! to [0.01, 1.0] — never zero, so ranking ties break by recency.

use serde::{Deserialize, Serialize};

use crate::error::Severity;

pub const QUALITY_MIN: f64 = 0.01;
pub const QUALITY_MAX: f64 = 1.0;

/// Failure counts past these thresholds draw extra demotion.
const FAILURE_PRESSURE_LOW: usize = 5;
const FAILURE_PRESSURE_HIGH: usize = 10;

/// Measured evidence backing a quality update. LLM opinion is not evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityEvidence {
    pub test_pass: bool,
    /// Coverage observed in this run, in [0,1].
    pub coverage: f64,
    /// Wall time of the run, for the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Severity of the failure when `test_pass` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_severity: Option<Severity>,
}

impl QualityEvidence {
    pub fn pass(coverage: f64) -> Self {
        Self {
            test_pass: true,
            coverage,
            latency_ms: None,
            failure_severity: None,
        }
    }

    pub fn fail(severity: Severity) -> Self {
        Self {
            test_pass: false,
            coverage: 0.0,
            latency_ms: None,
            failure_severity: Some(severity),
        }
    }
}

/// Clamp into the valid quality range.
pub fn clamp(score: f64) -> f64 {
    score.clamp(QUALITY_MIN, QUALITY_MAX)
}

/// Apply one piece of evidence to a current score.
///
/// `stored_coverage` is the coverage recorded at the previous passing run
/// (0.0 when none). `recent_failures` is the current failure-log length.
pub fn apply_evidence(
    current: f64,
    stored_coverage: f64,
    evidence: &QualityEvidence,
    recent_failures: usize,
) -> f64 {
    let mut score = current;

    if evidence.test_pass {
        if evidence.coverage >= stored_coverage {
            let gain = 0.5 * (evidence.coverage - stored_coverage);
            score += gain.min(0.05);
        }
    } else {
        let severity = evidence.failure_severity.unwrap_or(Severity::Medium);
        score -= match severity {
            Severity::Low => 0.01,
            Severity::Medium => 0.05,
            Severity::High => 0.10,
        };
        if recent_failures > FAILURE_PRESSURE_HIGH {
            score -= 0.10;
        } else if recent_failures > FAILURE_PRESSURE_LOW {
            score -= 0.05;
        }
    }

    clamp(score)
}

/// Normalize a loaded on-disk score. Historical stores recorded quality in
/// [0,100]; anything above 1.0 is treated as percent.
pub fn normalize_loaded(score: f64) -> f64 {
    if score > QUALITY_MAX {
        clamp(score / 100.0)
    } else {
        clamp(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_gain_bounded() {
        // Coverage jump of 0.4 would give 0.2 unbounded; capped at 0.05.
        let next = apply_evidence(0.5, 0.4, &QualityEvidence::pass(0.8), 0);
        assert!((next - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_pass_small_gain_proportional() {
        // 0.5 * (0.44 - 0.40) = 0.02 < cap.
        let next = apply_evidence(0.5, 0.40, &QualityEvidence::pass(0.44), 0);
        assert!((next - 0.52).abs() < 1e-9);
    }

    #[test]
    fn test_pass_with_lower_coverage_no_change() {
        let next = apply_evidence(0.5, 0.9, &QualityEvidence::pass(0.3), 0);
        assert!((next - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_failure_deltas_by_severity() {
        assert!((apply_evidence(0.5, 0.0, &QualityEvidence::fail(Severity::Low), 0) - 0.49).abs() < 1e-9);
        assert!((apply_evidence(0.5, 0.0, &QualityEvidence::fail(Severity::Medium), 0) - 0.45).abs() < 1e-9);
        assert!((apply_evidence(0.5, 0.0, &QualityEvidence::fail(Severity::High), 0) - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_failure_pressure_extra_demotion() {
        // 6 recent failures: -0.05 extra.
        let six = apply_evidence(0.5, 0.0, &QualityEvidence::fail(Severity::Low), 6);
        assert!((six - 0.44).abs() < 1e-9);
        // 11 recent failures: -0.10 extra (not cumulative with the -0.05 band).
        let eleven = apply_evidence(0.5, 0.0, &QualityEvidence::fail(Severity::Low), 11);
        assert!((eleven - 0.39).abs() < 1e-9);
    }

    #[test]
    fn test_clamped_floor_never_zero() {
        let mut score = 0.05;
        for _ in 0..20 {
            score = apply_evidence(score, 0.0, &QualityEvidence::fail(Severity::High), 12);
        }
        assert!((score - QUALITY_MIN).abs() < 1e-9);
    }

    #[test]
    fn test_clamped_ceiling() {
        let mut score = 0.97;
        for _ in 0..10 {
            score = apply_evidence(score, 0.0, &QualityEvidence::pass(1.0), 0);
        }
        assert!((score - QUALITY_MAX).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_loaded_percent_scale() {
        assert!((normalize_loaded(85.0) - 0.85).abs() < 1e-9);
        assert!((normalize_loaded(0.85) - 0.85).abs() < 1e-9);
        assert!((normalize_loaded(0.0) - QUALITY_MIN).abs() < 1e-9);
    }
}
