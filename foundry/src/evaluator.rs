//! Evaluator — normalized fitness from measured outcomes.
//!
//! The score is a pure function of test results and measured metrics
//! against declared caps. Model self-assessment is not an input, by
//! contract. Given identical inputs the score is identical.

use serde::{Deserialize, Serialize};

use crate::artifact::{quality, TestResults};

/// Caps a spec declares for metric conformance scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricCaps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<usize>,
}

/// Metrics observed during the test run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasuredMetrics {
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_rss_mb: Option<u64>,
    pub output_bytes: usize,
}

/// The evaluation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Normalized fitness in [0.01, 1.0].
    pub quality: f64,
    /// Short machine-readable reason.
    pub rationale_tag: String,
}

/// Per-cap conformance bonus and violation penalty.
const CAP_BONUS: f64 = 0.05;
const CAP_PENALTY: f64 = 0.10;

/// Failing artifacts never score above this.
const FAIL_CEILING: f64 = 0.4;

/// Score one test outcome.
///
/// `existing_quality` is the artifact's prior score when re-evaluating;
/// a failing run keeps the lower of it and the 0.4 ceiling.
pub fn score(
    test: &TestResults,
    metrics: &MeasuredMetrics,
    caps: &MetricCaps,
    existing_quality: Option<f64>,
) -> Evaluation {
    if !test.pass {
        let quality = quality::clamp(existing_quality.unwrap_or(FAIL_CEILING).min(FAIL_CEILING));
        return Evaluation {
            quality,
            rationale_tag: "tests_failed".to_string(),
        };
    }

    let mut value = test.coverage;
    let mut satisfied = 0u32;
    let mut violated = 0u32;

    let mut check = |within: Option<bool>| match within {
        Some(true) => satisfied += 1,
        Some(false) => violated += 1,
        None => {}
    };
    check(caps.latency_ms.map(|cap| metrics.latency_ms <= cap));
    check(match (caps.memory_mb, metrics.peak_rss_mb) {
        (Some(cap), Some(observed)) => Some(observed <= cap),
        // Unobservable memory neither rewards nor penalizes.
        _ => None,
    });
    check(caps.output_bytes.map(|cap| metrics.output_bytes <= cap));

    value += satisfied as f64 * CAP_BONUS;
    value -= violated as f64 * CAP_PENALTY;

    let rationale_tag = if violated > 0 {
        "cap_violated"
    } else if satisfied > 0 {
        "caps_met"
    } else {
        "coverage_base"
    };

    Evaluation {
        quality: quality::clamp(value),
        rationale_tag: rationale_tag.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> MetricCaps {
        MetricCaps {
            latency_ms: Some(1_000),
            memory_mb: Some(256),
            output_bytes: Some(10_000),
        }
    }

    fn fast_metrics() -> MeasuredMetrics {
        MeasuredMetrics {
            latency_ms: 100,
            peak_rss_mb: Some(32),
            output_bytes: 64,
        }
    }

    #[test]
    fn test_failing_capped_at_ceiling() {
        let eval = score(
            &TestResults::failing(0.9, vec!["case 3".into()]),
            &fast_metrics(),
            &caps(),
            None,
        );
        assert!((eval.quality - 0.4).abs() < 1e-9);
        assert_eq!(eval.rationale_tag, "tests_failed");
    }

    #[test]
    fn test_failing_keeps_lower_existing_quality() {
        let eval = score(
            &TestResults::failing(0.9, vec![]),
            &fast_metrics(),
            &caps(),
            Some(0.2),
        );
        assert!((eval.quality - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_all_caps_satisfied() {
        let eval = score(
            &TestResults::passing(0.8),
            &fast_metrics(),
            &caps(),
            None,
        );
        // 0.8 + 3 × 0.05.
        assert!((eval.quality - 0.95).abs() < 1e-9);
        assert_eq!(eval.rationale_tag, "caps_met");
    }

    #[test]
    fn test_violated_cap_penalized() {
        let slow = MeasuredMetrics {
            latency_ms: 5_000,
            ..fast_metrics()
        };
        let eval = score(&TestResults::passing(0.8), &slow, &caps(), None);
        // 0.8 + 2 × 0.05 − 0.10.
        assert!((eval.quality - 0.80).abs() < 1e-9);
        assert_eq!(eval.rationale_tag, "cap_violated");
    }

    #[test]
    fn test_unobservable_memory_is_neutral() {
        let blind = MeasuredMetrics {
            peak_rss_mb: None,
            ..fast_metrics()
        };
        let eval = score(&TestResults::passing(0.8), &blind, &caps(), None);
        // latency + output satisfied, memory skipped.
        assert!((eval.quality - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_no_caps_pure_coverage() {
        let eval = score(
            &TestResults::passing(0.75),
            &fast_metrics(),
            &MetricCaps::default(),
            None,
        );
        assert!((eval.quality - 0.75).abs() < 1e-9);
        assert_eq!(eval.rationale_tag, "coverage_base");
    }

    #[test]
    fn test_clamped_into_range() {
        let terrible = MeasuredMetrics {
            latency_ms: 9_999_999,
            peak_rss_mb: Some(9_999),
            output_bytes: usize::MAX,
        };
        let eval = score(&TestResults::passing(0.05), &terrible, &caps(), None);
        assert!((eval.quality - 0.01).abs() < 1e-9);

        let perfect = score(
            &TestResults::passing(1.0),
            &fast_metrics(),
            &caps(),
            None,
        );
        assert!((perfect.quality - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic() {
        let a = score(&TestResults::passing(0.6), &fast_metrics(), &caps(), None);
        let b = score(&TestResults::passing(0.6), &fast_metrics(), &caps(), None);
        assert_eq!(a, b);
    }
}
