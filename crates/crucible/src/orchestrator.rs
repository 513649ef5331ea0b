//! Orchestrator — owns the request lifecycle.
//!
//! classify → reuse, or plan → generate → validate → test → evaluate →
//! promote, with the auto-fix cache and repair cycle looping on failure
//! under one bounded budget. Every request carries a deadline; a watchdog
//! cancels the request token when it passes, and every suspendable
//! operation observes both. Failures fold into the response as a
//! `FailureReport`; an execution record is emitted either way.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foundry::artifact::quality::QualityEvidence;
use foundry::classifier::{Classification, ReuseDecision, TaskClassifier};
use foundry::evaluator::{self, MeasuredMetrics, MetricCaps};
use foundry::fixes::{FixCache, FixContext, FixPattern, FixScope};
use foundry::records::{task_hash, ExecutionRecord, RecordLog};
use foundry::runner::{ResourceLimits, RunOutcome, SandboxRunner};
use foundry::tools::ScenarioQuery;
use foundry::validator::{ValidationReport, ValidatorPipeline};
use foundry::{
    Artifact, ArtifactCandidate, ArtifactKind, ArtifactStore, EngineConfig, EngineError,
    EngineEvent, FailureEntry, FailureReport, Lineage, SharedEventBus, TestResults, ToolRegistry,
};

use crate::embedding::EmbeddingGateway;
use crate::gateway::{GenerateRequest, ModelGateway, ModelRole};
use crate::genpool::{
    self, default_generators, extract_code_block, generation_deadline, GeneratorPool,
};
use crate::planner::{Overseer, TaskSpec, TestCase};
use crate::repair::{
    self, derive_patch, escalation_roles, repair_prompt, signature_from_run,
    signature_from_validation, RepairBudget,
};
use crate::telemetry::RequestMetrics;

/// Cached fixes tried per failure before repair generation.
const FIX_TOP_K: usize = 3;

/// Total repair attempts (cached fixes + repair generations).
const REPAIR_BUDGET: u32 = 6;

/// Default request deadlines per mode.
const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(300);
const OPTIMIZE_TIMEOUT: Duration = Duration::from_secs(1_800);

/// Execution-mode negotiation: interactive keeps the pool small and the
/// deadline tight; optimize widens both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Interactive,
    Optimize,
}

/// One incoming request.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub request_id: String,
    pub task_text: String,
    pub mode: ExecutionMode,
    pub timeout_ms: Option<u64>,
}

impl EngineRequest {
    pub fn interactive(task_text: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            task_text: task_text.to_string(),
            mode: ExecutionMode::Interactive,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// The response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub request_id: String,
    pub decision: Option<ReuseDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    pub promoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReport>,
    /// True when the store served this request memory-only.
    pub degraded: bool,
    pub wall_ms: u64,
}

impl EngineResponse {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Successful pipeline outcome, before response assembly.
struct PipelineSuccess {
    artifact_id: String,
    namespace: String,
    output: Option<serde_json::Value>,
    quality: f64,
    promoted: bool,
}

/// One validated-and-tested candidate.
struct Candidate {
    source: String,
    validation: ValidationReport,
    test_results: TestResults,
    measured: MeasuredMetrics,
    quality: f64,
    sample_output: Option<serde_json::Value>,
    last_run: Option<RunOutcome>,
}

impl Candidate {
    fn passing(&self) -> bool {
        self.validation.ok && self.test_results.pass
    }
}

/// The orchestrator.
pub struct Orchestrator {
    config: EngineConfig,
    store: Arc<ArtifactStore>,
    fixes: Arc<FixCache>,
    registry: Arc<ToolRegistry>,
    gateway: Arc<ModelGateway>,
    embeddings: EmbeddingGateway,
    classifier: TaskClassifier,
    pipeline: ValidatorPipeline,
    runner: SandboxRunner,
    records: Arc<RecordLog>,
    events: SharedEventBus,
    planner: Overseer,
    pool: GeneratorPool,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<ArtifactStore>,
        fixes: Arc<FixCache>,
        registry: Arc<ToolRegistry>,
        gateway: Arc<ModelGateway>,
        records: Arc<RecordLog>,
        events: SharedEventBus,
    ) -> Self {
        let embeddings = EmbeddingGateway::new(Arc::clone(&gateway), config.store.embedding_dim);
        let classifier = TaskClassifier::new(config.classifier_thresholds());
        let pipeline = config.validator_pipeline();
        let planner = Overseer::new(Arc::clone(&gateway), config.default_limits());
        let pool = GeneratorPool::new(Arc::clone(&gateway));
        Self {
            config,
            store,
            fixes,
            registry,
            gateway,
            embeddings,
            classifier,
            pipeline,
            runner: SandboxRunner::default(),
            records,
            events,
            planner,
            pool,
        }
    }

    /// Swap the sandbox command (hermetic tests use a shell runner).
    pub fn with_runner(mut self, runner: SandboxRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Handle one request end to end. Never panics, never returns Err:
    /// failures are reported in the response.
    pub async fn handle(&self, request: EngineRequest) -> EngineResponse {
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(match request.mode {
                ExecutionMode::Interactive => INTERACTIVE_TIMEOUT,
                ExecutionMode::Optimize => OPTIMIZE_TIMEOUT,
            });
        let deadline = Instant::now() + timeout;
        let cancel = CancellationToken::new();

        // Watchdog: past the deadline every suspendable operation sees
        // the cancelled token and unwinds, releasing model slots and
        // sandbox children.
        let watchdog = {
            let cancel = cancel.clone();
            let events = Arc::clone(&self.events);
            let request_id = request.request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                cancel.cancel();
                events.publish(EngineEvent::RequestCancelled {
                    request_id,
                    at: Utc::now(),
                });
            })
        };

        let mut metrics = RequestMetrics::new();
        let mut classification = Classification {
            decision: ReuseDecision::Different,
            reference_id: None,
            similarity: 0.0,
        };
        let result = self
            .process(&request, &cancel, deadline, &mut metrics, &mut classification)
            .await;
        watchdog.abort();

        let wall_ms = metrics.wall_ms();
        let degraded = self.store.degraded();
        let (response, error_kind, artifact_id) = match result {
            Ok(success) => (
                EngineResponse {
                    request_id: request.request_id.clone(),
                    decision: Some(classification.decision),
                    artifact_id: Some(success.artifact_id.clone()),
                    namespace: Some(success.namespace),
                    output: success.output,
                    quality: Some(success.quality),
                    promoted: success.promoted,
                    error: None,
                    degraded,
                    wall_ms,
                },
                None,
                Some(success.artifact_id),
            ),
            Err(err) => {
                warn!(request = request.request_id.as_str(), error = %err, "request failed");
                (
                    EngineResponse {
                        request_id: request.request_id.clone(),
                        decision: Some(classification.decision),
                        artifact_id: None,
                        namespace: None,
                        output: None,
                        quality: None,
                        promoted: false,
                        error: Some(err.to_report()),
                        degraded,
                        wall_ms,
                    },
                    Some(err.kind()),
                    None,
                )
            }
        };

        self.records.append(ExecutionRecord {
            request_id: request.request_id.clone(),
            task_hash: task_hash(&request.task_text),
            classifier_decision: classification.decision,
            selected_tool: metrics.selected_tool(),
            attempts: metrics.attempts().to_vec(),
            final_artifact_id: artifact_id,
            wall_time_ms: wall_ms,
            cost_units: metrics.cost_units(),
            error_kind,
            degraded,
            at: Utc::now(),
        });
        response
    }

    async fn process(
        &self,
        request: &EngineRequest,
        cancel: &CancellationToken,
        deadline: Instant,
        metrics: &mut RequestMetrics,
        classification: &mut Classification,
    ) -> Result<PipelineSuccess, EngineError> {
        // Embedding failure degrades to DIFFERENT, not an error.
        let task_embedding = match self
            .embeddings
            .embed_one(&request.request_id, &request.task_text, cancel, deadline)
            .await
        {
            Ok(vector) => {
                metrics.add_role_cost(ModelRole::Embedding);
                Some(vector)
            }
            Err(EngineError::CancelRequested(reason)) => {
                return Err(EngineError::CancelRequested(reason))
            }
            Err(err) => {
                warn!(error = %err, "embedding unavailable, proceeding without reuse");
                None
            }
        };

        *classification = self
            .classifier
            .classify(task_embedding.as_deref(), &self.store);
        info!(
            request = request.request_id.as_str(),
            decision = %classification.decision,
            similarity = classification.similarity,
            "task classified"
        );

        match classification.decision {
            ReuseDecision::Same => {
                let reference_id = classification
                    .reference_id
                    .clone()
                    .ok_or_else(|| EngineError::StorageUnavailable("classifier returned SAME without a reference".into()))?;
                self.reuse(&reference_id, task_embedding.as_deref(), cancel, deadline)
                    .await
            }
            ReuseDecision::Related | ReuseDecision::Different => {
                let reference = classification
                    .reference_id
                    .as_ref()
                    .and_then(|id| self.store.get(id));
                self.generate_path(
                    request,
                    classification.decision,
                    reference,
                    task_embedding,
                    cancel,
                    deadline,
                    metrics,
                )
                .await
            }
        }
    }

    // ── SAME: run the stored artifact ──────────────────────────────────

    async fn reuse(
        &self,
        reference_id: &str,
        task_embedding: Option<&[f32]>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<PipelineSuccess, EngineError> {
        let artifact = self
            .store
            .get(reference_id)
            .ok_or_else(|| EngineError::StorageUnavailable(format!("artifact {reference_id} vanished")))?;
        self.store.update_usage(reference_id)?;

        let limits = self.config.default_limits();
        let outcome = self
            .run_with_cancel(&artifact.source, b"{}", &limits, cancel, deadline)
            .await?;

        let quality = if outcome.success() {
            let coverage = artifact
                .test_results
                .as_ref()
                .map(|t| t.coverage)
                .unwrap_or(1.0);
            self.store
                .update_quality(reference_id, &QualityEvidence::pass(coverage))?
        } else {
            let severity = repair::severity_from_run(&outcome, false);
            if let Some(embedding) = task_embedding {
                let _ = self.store.record_failure(
                    reference_id,
                    FailureEntry {
                        scenario_embedding: embedding.to_vec(),
                        error_kind: signature_from_run(&outcome, false).error_kind,
                        severity,
                        at: Utc::now(),
                    },
                );
            }
            self.store
                .update_quality(reference_id, &QualityEvidence::fail(severity))?
        };

        Ok(PipelineSuccess {
            artifact_id: artifact.id.clone(),
            namespace: artifact.namespace.clone(),
            output: outcome.result_value(),
            quality,
            promoted: false,
        })
    }

    // ── RELATED / DIFFERENT: the generation pipeline ───────────────────

    #[allow(clippy::too_many_arguments)]
    async fn generate_path(
        &self,
        request: &EngineRequest,
        decision: ReuseDecision,
        reference: Option<Artifact>,
        task_embedding: Option<Vec<f32>>,
        cancel: &CancellationToken,
        deadline: Instant,
        metrics: &mut RequestMetrics,
    ) -> Result<PipelineSuccess, EngineError> {
        let spec = self
            .planner
            .plan(
                &request.request_id,
                &request.task_text,
                decision,
                reference.as_ref(),
                cancel,
                deadline,
            )
            .await?;
        metrics.add_role_cost(ModelRole::Powerful);

        // Tool selection for the roles the plan names; failures feed
        // back into the registry after the run.
        let selected_tool = spec.tools_needed.first().and_then(|role| {
            let scenario = ScenarioQuery {
                text: request.task_text.clone(),
                embedding: task_embedding.clone(),
                tags: BTreeSet::new(),
            };
            self.registry.get(role, Some(&scenario))
        });
        if let Some(selected) = &selected_tool {
            metrics.set_selected_tool(&selected.descriptor.tool_id);
        }

        let pool_width = match request.mode {
            ExecutionMode::Interactive => self.config.generation.parallel.max_variants.min(3),
            ExecutionMode::Optimize => self.config.generation.parallel.max_variants,
        };
        let generators = default_generators(pool_width);
        let variants = self
            .pool
            .generate(
                &request.request_id,
                &spec,
                &generators,
                cancel,
                generation_deadline(deadline),
            )
            .await?;
        for generator in &generators {
            metrics.add_role_cost(generator.role);
        }

        // Validate and test every usable variant; completion order is
        // irrelevant, the scoring below is deterministic.
        let mut candidates: Vec<(Candidate, u64)> = Vec::new();
        let mut best_failing: Option<Candidate> = None;
        for variant in variants.into_iter().filter(|v| v.ok) {
            let candidate = self
                .validate_and_test(&variant.source, &spec, cancel, deadline)
                .await?;
            metrics.record_attempt(
                &variant.generator_name,
                candidate.validation.ok,
                candidate.validation.ok.then_some(candidate.test_results.pass),
                Some(candidate.quality),
                variant.gen_wall_ms,
            );
            if candidate.passing() {
                candidates.push((candidate, variant.gen_wall_ms));
            } else if best_failing.is_none()
                || (candidate.validation.ok
                    && !best_failing.as_ref().map(|c| c.validation.ok).unwrap_or(false))
            {
                best_failing = Some(candidate);
            }
        }

        let chosen = self.select_winner(candidates);
        let chosen = match chosen {
            Some(candidate) => candidate,
            None => {
                let broken = best_failing.ok_or_else(|| {
                    EngineError::AllGeneratorsFailed("no usable variant to repair".into())
                })?;
                match self
                    .repair_cycle(
                        &request.request_id,
                        broken,
                        &spec,
                        cancel,
                        deadline,
                        metrics,
                        task_embedding.as_deref(),
                    )
                    .await
                {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        if let Some(selected) = &selected_tool {
                            self.registry.record_failure(
                                &selected.descriptor.tool_id,
                                task_embedding.clone().unwrap_or_default(),
                                foundry::ErrorKind::Runtime,
                                foundry::Severity::Medium,
                            );
                        }
                        return Err(err);
                    }
                }
            }
        };

        // Store, then promote when strictly fitter than the incumbent.
        // `chosen` passes by construction: the winner was selected among
        // passing candidates or survived the repair cycle.
        let embedding = task_embedding
            .clone()
            .unwrap_or_else(|| self.embeddings.zero_vector());
        let put = self.store.put(ArtifactCandidate {
            kind: ArtifactKind::Function,
            namespace: spec.namespace.clone(),
            source: chosen.source.clone(),
            interface: Default::default(),
            tool_refs: selected_tool
                .as_ref()
                .map(|t| vec![t.descriptor.tool_id.clone()])
                .unwrap_or_default(),
            tags: BTreeSet::from(["generated".to_string(), spec.namespace.clone()]),
            embedding,
            lineage: Lineage {
                parent: reference.as_ref().map(|r| r.id.clone()),
                mutation_hint: (decision == ReuseDecision::Related)
                    .then(|| "planned as diff from reference".to_string()),
            },
            test_results: Some(chosen.test_results.clone()),
            quality_score: chosen.quality,
        })?;

        let mut promoted = false;
        let incumbent_quality = self
            .store
            .head(&spec.namespace)
            .map(|head| head.quality_score);
        if incumbent_quality.map(|q| chosen.quality > q).unwrap_or(true) {
            let outcome = self.store.promote(&spec.namespace, &put.id)?;
            promoted = true;
            self.events.publish(EngineEvent::ArtifactPromoted {
                namespace: spec.namespace.clone(),
                artifact_id: put.id.clone(),
                previous: outcome.previous,
                at: Utc::now(),
            });
        }
        if let Some(selected) = &selected_tool {
            self.registry.record_success(&selected.descriptor.tool_id);
        }

        info!(
            namespace = spec.namespace.as_str(),
            artifact = put.id.as_str(),
            quality = chosen.quality,
            promoted,
            "artifact stored"
        );
        Ok(PipelineSuccess {
            artifact_id: put.id,
            namespace: spec.namespace,
            output: chosen.sample_output,
            quality: chosen.quality,
            promoted,
        })
    }

    /// Deterministic quality × speed selection over passing candidates.
    fn select_winner(&self, mut candidates: Vec<(Candidate, u64)>) -> Option<Candidate> {
        if candidates.is_empty() {
            return None;
        }
        let fastest = candidates.iter().map(|(_, ms)| *ms).min().unwrap_or(1);
        let scored: Vec<(f64, f64)> = candidates
            .iter()
            .map(|(c, ms)| (c.quality, genpool::speed_score(*ms, fastest)))
            .collect();
        let index = genpool::select_best(
            &scored,
            self.config.generation.parallel.quality_weight,
            self.config.generation.parallel.speed_weight,
        )?;
        Some(candidates.swap_remove(index).0)
    }

    // ── Repair cycle ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn repair_cycle(
        &self,
        request_id: &str,
        broken: Candidate,
        spec: &TaskSpec,
        cancel: &CancellationToken,
        deadline: Instant,
        metrics: &mut RequestMetrics,
        task_embedding: Option<&[f32]>,
    ) -> Result<Candidate, EngineError> {
        let mut budget = RepairBudget::new(REPAIR_BUDGET);
        let broken_source = broken.source.clone();
        let signature = if !broken.validation.ok {
            signature_from_validation(&broken.validation)
        } else {
            broken
                .last_run
                .as_ref()
                .map(|run| signature_from_run(run, !broken.test_results.pass))
        };
        let context = FixContext {
            file_name: "main.py".into(),
            tool_id: None,
            tags: BTreeSet::new(),
        };

        // Phase 1: proven fixes from the cache, speculatively applied.
        if let Some(signature) = &signature {
            for fix in self.fixes.lookup(signature, &context, FIX_TOP_K) {
                if !budget.try_consume() {
                    break;
                }
                let Some(patched) = fix.patch.apply(&broken_source) else {
                    continue; // inapplicable, not a failure
                };
                let candidate = self
                    .validate_and_test(&patched, spec, cancel, deadline)
                    .await?;
                metrics.record_attempt(
                    &format!("fix:{}", fix.id),
                    candidate.validation.ok,
                    Some(candidate.test_results.pass),
                    Some(candidate.quality),
                    0,
                );
                if candidate.passing() {
                    self.fixes.record(&fix.id, true);
                    info!(fix = fix.id.as_str(), "cached fix repaired the artifact");
                    return Ok(candidate);
                }
                self.fixes.record(&fix.id, false);
            }
        }

        // Phase 2: repair generation with role escalation.
        let roles = escalation_roles(ModelRole::Base);
        let mut current_source = broken_source.clone();
        let mut error_context = describe_failure(&broken);
        let mut attempt = 0u32;
        let mut last_reason = error_context.clone();
        while budget.try_consume() {
            if cancel.is_cancelled() {
                return Err(EngineError::CancelRequested("repair cycle".into()));
            }
            let role = roles[(attempt as usize).min(roles.len() - 1)];
            let request = GenerateRequest {
                role,
                system: None,
                prompt: repair_prompt(spec, &current_source, &error_context, attempt + 1),
                temperature: 0.2,
                max_tokens: 4096,
                seed: Some(attempt as u64),
            };
            attempt += 1;
            let response = match self.gateway.generate(request_id, &request, cancel, deadline).await {
                Ok(response) => response,
                Err(crate::gateway::GatewayError::Cancelled) => {
                    return Err(EngineError::CancelRequested("repair cycle".into()))
                }
                Err(err) => {
                    warn!(attempt, role = %role, error = %err, "repair generation failed");
                    last_reason = err.to_string();
                    continue;
                }
            };
            metrics.add_role_cost(role);

            let repaired = extract_code_block(&response.text);
            let candidate = self
                .validate_and_test(&repaired, spec, cancel, deadline)
                .await?;
            metrics.record_attempt(
                &format!("repair-{role}-{attempt}"),
                candidate.validation.ok,
                Some(candidate.test_results.pass),
                Some(candidate.quality),
                0,
            );
            if candidate.passing() {
                self.admit_novel_fix(&signature, &broken_source, &candidate.source);
                info!(attempt, role = %role, "repair generation succeeded");
                return Ok(candidate);
            }
            last_reason = describe_failure(&candidate);
            error_context = last_reason.clone();
            current_source = candidate.source;
        }

        // Exhausted: store the last attempt as a non-promoted artifact so
        // the failure and its evidence survive, then surface the error.
        let embedding = task_embedding
            .map(|e| e.to_vec())
            .unwrap_or_else(|| self.embeddings.zero_vector());
        let stored = self.store.put(ArtifactCandidate {
            kind: ArtifactKind::Function,
            namespace: spec.namespace.clone(),
            source: current_source,
            interface: Default::default(),
            tool_refs: Vec::new(),
            tags: BTreeSet::from(["generated".to_string(), "unfixed".to_string()]),
            embedding: embedding.clone(),
            lineage: Lineage::default(),
            test_results: Some(TestResults::failing(0.0, vec![last_reason.clone()])),
            quality_score: foundry::QUALITY_MIN,
        });
        if let (Ok(put), Some(signature)) = (&stored, &signature) {
            let _ = self.store.record_failure(
                &put.id,
                FailureEntry {
                    scenario_embedding: embedding,
                    error_kind: signature.error_kind,
                    severity: foundry::Severity::Medium,
                    at: Utc::now(),
                },
            );
        }
        Err(EngineError::TestsUnfixable {
            attempts: budget.used,
            reason: last_reason,
        })
    }

    /// Mine and admit a fix pattern when this class of error has no
    /// cached fix yet. Admission requires the confirmed success that
    /// just happened.
    fn admit_novel_fix(
        &self,
        signature: &Option<foundry::ErrorSignature>,
        broken: &str,
        repaired: &str,
    ) {
        let Some(signature) = signature else { return };
        let context = FixContext {
            file_name: "main.py".into(),
            tool_id: None,
            tags: BTreeSet::new(),
        };
        if !self.fixes.lookup(signature, &context, 1).is_empty() {
            return;
        }
        if let Some(patch) = derive_patch(broken, repaired) {
            let fix = FixPattern::new(
                signature.clone(),
                broken,
                patch,
                FixScope {
                    file_pattern: Some("*.py".into()),
                    ..Default::default()
                },
            );
            if let Some(id) = self.fixes.admit(fix) {
                info!(fix = id.as_str(), "novel fix pattern admitted");
            }
        }
    }

    // ── Validation + testing ───────────────────────────────────────────

    async fn validate_and_test(
        &self,
        source: &str,
        spec: &TaskSpec,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Candidate, EngineError> {
        let validation = self.pipeline.validate(source);
        if !validation.ok {
            return Ok(Candidate {
                source: validation.final_source.clone(),
                test_results: TestResults::failing(0.0, vec!["validators failed".into()]),
                measured: MeasuredMetrics::default(),
                quality: foundry::QUALITY_MIN,
                sample_output: None,
                last_run: None,
                validation,
            });
        }

        let final_source = validation.final_source.clone();
        let cases: Vec<TestCase> = if spec.test_cases.is_empty() {
            vec![TestCase {
                input: serde_json::json!({}),
                expected: None,
            }]
        } else {
            spec.test_cases.clone()
        };

        let mut passed = 0usize;
        let mut failing_cases = Vec::new();
        let mut measured = MeasuredMetrics::default();
        let mut sample_output = None;
        let mut last_run = None;
        for (index, case) in cases.iter().enumerate() {
            let input = serde_json::to_vec(&case.input).unwrap_or_else(|_| b"{}".to_vec());
            let outcome = self
                .run_with_cancel(&final_source, &input, &spec.resource_caps, cancel, deadline)
                .await?;

            measured.latency_ms = measured.latency_ms.max(outcome.wall_ms);
            measured.output_bytes = measured.output_bytes.max(outcome.stdout.len());
            if let Some(rss) = outcome.peak_rss_mb {
                measured.peak_rss_mb = Some(measured.peak_rss_mb.unwrap_or(0).max(rss));
            }

            let result = outcome.result_value();
            let case_passed = outcome.success()
                && result.is_some()
                && case
                    .expected
                    .as_ref()
                    .map(|expected| result.as_ref() == Some(expected))
                    .unwrap_or(true);
            if case_passed {
                passed += 1;
                if sample_output.is_none() {
                    sample_output = result;
                }
            } else {
                failing_cases.push(format!(
                    "case {index}: expected {:?}, exit {}{}",
                    case.expected,
                    outcome.exit_code,
                    if outcome.timed_out { ", timed out" } else { "" }
                ));
            }
            last_run = Some(outcome);
        }

        let coverage = passed as f64 / cases.len() as f64;
        let test_results = if passed == cases.len() {
            TestResults::passing(coverage)
        } else {
            TestResults::failing(coverage, failing_cases)
        };
        let caps = MetricCaps {
            latency_ms: Some(spec.resource_caps.wall_ms),
            memory_mb: spec.resource_caps.mem_mb,
            output_bytes: Some(spec.resource_caps.output_bytes),
        };
        let evaluation = evaluator::score(&test_results, &measured, &caps, None);

        Ok(Candidate {
            source: final_source,
            validation,
            test_results,
            measured,
            quality: evaluation.quality,
            sample_output,
            last_run,
        })
    }

    /// Sandbox run that observes the request deadline and token. The
    /// child is killed when either fires.
    async fn run_with_cancel(
        &self,
        source: &str,
        input: &[u8],
        limits: &ResourceLimits,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<RunOutcome, EngineError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || cancel.is_cancelled() {
            return Err(EngineError::CancelRequested("sandbox run".into()));
        }
        let mut limits = limits.clone();
        limits.wall_ms = limits.wall_ms.min(remaining.as_millis() as u64).max(1);

        tokio::select! {
            outcome = self.runner.run(source, input, &limits) => {
                outcome.map_err(|e| EngineError::BackendUnavailable {
                    backend: "sandbox".into(),
                    reason: e.to_string(),
                })
            }
            _ = cancel.cancelled() => {
                // Dropping the run future kills the child (kill_on_drop).
                Err(EngineError::CancelRequested("sandbox run".into()))
            }
        }
    }
}

fn describe_failure(candidate: &Candidate) -> String {
    if !candidate.validation.ok {
        if let Some(gate) = candidate.validation.first_failure() {
            let details: Vec<String> = gate
                .messages
                .iter()
                .map(|m| format!("{}: {}", m.code, m.text))
                .collect();
            return format!("validator `{}` failed: {}", gate.name, details.join("; "));
        }
        return "validators failed".into();
    }
    let mut parts = candidate.test_results.failing_cases.clone();
    if let Some(run) = &candidate.last_run {
        let stderr = run.stderr_text();
        if !stderr.trim().is_empty() {
            parts.push(format!("stderr: {}", stderr.trim()));
        }
    }
    if parts.is_empty() {
        "tests failed".into()
    } else {
        parts.join("\n")
    }
}
