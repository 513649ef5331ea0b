//! Store property tests — randomized validation of the artifact store
//! invariants across varied inputs.
//!
//! Tests verify:
//! - Content ids are exactly the hash of {kind, canonical source, tool
//!   refs, interface}
//! - Namespace heads always point at stored, promotable artifacts, and
//!   retired artifacts always name a promoted successor
//! - Quality stays in [0.01, 1.0] and rises only on passing evidence
//! - Read-your-writes: a put is visible to find_similar before it returns
//! - The validator pipeline's `ok` implies every gate passed, and
//!   auto-fix terminates within its attempt budget

use std::collections::BTreeSet;

use foundry::artifact::quality::QualityEvidence;
use foundry::validator::checks::builtin_validators;
use foundry::validator::GateOutcome;
use foundry::{
    canonical_source, content_id, ArtifactCandidate, ArtifactInterface, ArtifactKind,
    ArtifactStore, InterfaceField, Lineage, SemType, Severity, SimilarityQuery, TestResults,
    ValidatorPipeline, QUALITY_MAX, QUALITY_MIN,
};

/// Small deterministic generator so the "random" inputs are stable
/// across runs.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn unit_f64(&mut self) -> f64 {
        (self.next() % 10_000) as f64 / 10_000.0
    }

    fn vector(&mut self, dim: usize) -> Vec<f32> {
        (0..dim).map(|_| (self.next() % 1000) as f32 / 1000.0 + 0.001).collect()
    }
}

fn candidate(namespace: &str, source: &str, embedding: Vec<f32>, quality: f64) -> ArtifactCandidate {
    ArtifactCandidate {
        kind: ArtifactKind::Function,
        namespace: namespace.into(),
        source: source.into(),
        interface: ArtifactInterface {
            inputs: vec![InterfaceField::new("x", SemType::Int)],
            outputs: vec![InterfaceField::new("result", SemType::Int)],
        },
        tool_refs: vec!["tool-a".into(), "tool-b".into()],
        tags: BTreeSet::from(["prop".to_string()]),
        embedding,
        lineage: Lineage::default(),
        test_results: Some(TestResults::passing(1.0)),
        quality_score: quality,
    }
}

// ── Property: id is the content hash ───────────────────────────────────

#[test]
fn prop_id_matches_content_hash() {
    let mut rng = Lcg(7);
    let store = ArtifactStore::in_memory(4);
    for i in 0..50 {
        let source = format!("import sys, json\nprint(json.dumps({{\"result\": {i}}}))\n");
        let put = store
            .put(candidate("hash_ns", &source, rng.vector(4), 0.5))
            .unwrap();
        let artifact = store.get(&put.id).unwrap();
        let expected = content_id(
            artifact.kind,
            &artifact.source,
            &artifact.tool_refs,
            &artifact.interface,
        );
        assert_eq!(artifact.id, expected, "iteration {i}");
        assert_eq!(artifact.source, canonical_source(&source));
    }
}

// ── Property: heads and retirement stay consistent ─────────────────────

#[test]
fn prop_head_always_stored_and_retired_points_at_promoted() {
    let mut rng = Lcg(11);
    let store = ArtifactStore::in_memory(4);

    let mut ids = Vec::new();
    for generation in 0..10 {
        let put = store
            .put(candidate(
                "head_ns",
                &format!("print({generation})\n"),
                rng.vector(4),
                0.5 + generation as f64 / 40.0,
            ))
            .unwrap();
        store.promote("head_ns", &put.id).unwrap();
        ids.push(put.id);

        // head(n) ∈ artifacts(n)
        let head = store.head("head_ns").unwrap();
        let namespace_ids: Vec<String> = store
            .artifacts_in_namespace("head_ns")
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert!(namespace_ids.contains(&head.id));
        assert!(head.promotable() || head.superseded_by.is_none());
    }

    // Every retired artifact names a successor, and following the chain
    // ends at the current head.
    let head_id = store.head("head_ns").unwrap().id;
    for id in &ids {
        let artifact = store.get(id).unwrap();
        if let Some(successor) = &artifact.superseded_by {
            assert!(store.get(successor).is_some());
        } else {
            assert_eq!(&artifact.id, &head_id);
        }
    }
}

// ── Property: quality stays clamped, rises only on passing evidence ────

#[test]
fn prop_quality_clamped_and_monotone() {
    let mut rng = Lcg(13);
    for round in 0..20 {
        let store = ArtifactStore::in_memory(2);
        let put = store
            .put(candidate(
                "quality_ns",
                &format!("print({round})\n"),
                vec![1.0, 0.0],
                rng.unit_f64(),
            ))
            .unwrap();

        let mut previous = store.get(&put.id).unwrap().quality_score;
        for _ in 0..30 {
            let passing = rng.next() % 2 == 0;
            let evidence = if passing {
                QualityEvidence::pass(rng.unit_f64())
            } else {
                QualityEvidence::fail(match rng.next() % 3 {
                    0 => Severity::Low,
                    1 => Severity::Medium,
                    _ => Severity::High,
                })
            };
            let next = store.update_quality(&put.id, &evidence).unwrap();

            assert!((QUALITY_MIN..=QUALITY_MAX).contains(&next));
            if passing {
                assert!(next >= previous, "passing evidence must never lower quality");
            } else {
                assert!(next <= previous, "failing evidence must never raise quality");
            }
            previous = next;
        }
    }
}

// ── Property: read-your-writes ─────────────────────────────────────────

#[test]
fn prop_read_your_writes() {
    let mut rng = Lcg(17);
    let store = ArtifactStore::in_memory(8);
    for i in 0..40 {
        let embedding = rng.vector(8);
        let put = store
            .put(candidate(
                &format!("ryw_ns_{i}"),
                &format!("print({i})\n"),
                embedding.clone(),
                0.9,
            ))
            .unwrap();

        let hits = store.find_similar(
            &SimilarityQuery::new(embedding, 1).with_kinds(&[ArtifactKind::Function]),
        );
        assert_eq!(hits.len(), 1, "iteration {i}");
        assert_eq!(hits[0].0.id, put.id, "iteration {i}");
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }
}

// ── Property: pipeline ok implies every gate passed ────────────────────

#[test]
fn prop_ok_implies_all_gates_passed() {
    let sources = [
        "import sys, json\nprint(json.dumps({\"result\": 1}))\n",
        "import sys, json\ndata = json.load(sys.stdin)\nprint(json.dumps({\"result\": data}))\n",
        "from main import add\nimport sys, json\nprint(json.dumps({\"result\": 2}))\n",
        "import subprocess\nprint(1)\n",
        "print((1\n",
    ];
    for source in sources {
        let pipeline = ValidatorPipeline::new(builtin_validators(), 3);
        let report = pipeline.validate(source);
        if report.ok {
            assert!(
                report.gates.iter().all(|g| g.outcome == GateOutcome::Passed),
                "ok report with non-passing gate for: {source}"
            );
            // And the surviving source independently passes every gate.
            for validator in builtin_validators() {
                assert!(
                    validator.check(&report.final_source).passed,
                    "validator {} rejects an ok source",
                    validator.name()
                );
            }
        }
    }
}

// ── Property: auto-fix terminates within its budget ────────────────────

#[test]
fn prop_autofix_bounded() {
    for max_attempts in [0u32, 1, 3, 5] {
        let pipeline = ValidatorPipeline::new(builtin_validators(), max_attempts);
        // Self-import is fixable in one attempt; the budget only matters
        // when it is zero.
        let source = "from main import add\nimport sys, json\ndata = json.load(sys.stdin)\nprint(json.dumps({\"result\": 2}))\n";
        let report = pipeline.validate(source);
        assert!(report.autofix_attempts <= max_attempts);
        if max_attempts >= 1 {
            assert!(report.ok);
        } else {
            assert!(!report.ok);
        }
    }
}

// ── Property: put is idempotent under re-submission ────────────────────

#[test]
fn prop_put_idempotent() {
    let store = ArtifactStore::in_memory(2);
    let mut first_id = None;
    for _ in 0..5 {
        let put = store
            .put(candidate("idem_ns", "print(1)\n", vec![1.0, 0.0], 0.7))
            .unwrap();
        match &first_id {
            None => first_id = Some(put.id),
            Some(expected) => assert_eq!(&put.id, expected),
        }
    }
    assert_eq!(store.len(), 1);
}
