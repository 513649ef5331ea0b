//! Foundry — deterministic core of the crucible engine.
//!
//! This crate provides:
//! - Content-addressed artifact model with measured quality scores
//! - The artifact store: tag, vector, and namespace-head indexes with a
//!   JSON file-per-artifact persistence layout
//! - The auto-fix cache of proven `error signature → patch` patterns
//! - The tool registry with fitness-based selection and evolution events
//! - The static validator pipeline with bounded auto-fix
//! - The sandboxed runner for generated artifacts
//! - Deterministic evaluator, task classifier, and execution records
//! - Configuration and the engine error taxonomy
//!
//! Nothing in this crate talks to a model backend; network I/O lives in
//! the engine crate. Everything here is deterministic given its inputs,
//! which is what makes the engine's scoring trustworthy.

pub mod artifact;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod evaluator;
pub mod fixes;
pub mod records;
pub mod runner;
pub mod store;
pub mod tools;
pub mod truncate;
pub mod validator;

// Re-export key artifact types
pub use artifact::{
    canonical_source, content_id, Artifact, ArtifactCandidate, ArtifactInterface, ArtifactKind,
    FailureEntry, InterfaceField, Lineage, SemType, TestResults,
};
pub use artifact::quality::{QualityEvidence, QUALITY_MAX, QUALITY_MIN};

// Re-export store types
pub use store::{
    ArtifactStore, PromotionOutcome, PutOutcome, SimilarityQuery, StoreError, StoreResult,
};

// Re-export fix cache types
pub use fixes::{ErrorSignature, FixCache, FixContext, FixPattern, FixScope, PatchTransform};

// Re-export tool registry types
pub use tools::{
    Invocation, ScenarioQuery, SelectedTool, ToolDescriptor, ToolHealth, ToolKind, ToolRegistry,
    ToolSet,
};

// Re-export validator types
pub use validator::{
    GateOutcome, GateResult, ValidationReport, Validator, ValidatorMessage, ValidatorOutcome,
    ValidatorPipeline,
};

// Re-export runner types
pub use runner::{ResourceLimits, RunCommand, RunOutcome, SandboxRunner};

// Re-export evaluator types
pub use evaluator::{Evaluation, MeasuredMetrics, MetricCaps};

// Re-export classifier types
pub use classifier::{Classification, ClassifierThresholds, ReuseDecision, TaskClassifier};

// Re-export record types
pub use records::{task_hash, AttemptRecord, ExecutionRecord, RecordLog};

// Re-export configuration
pub use config::EngineConfig;

// Re-export error taxonomy
pub use error::{EngineError, EngineResult, ErrorKind, FailureReport, Severity};

// Re-export event bus
pub use events::{EngineEvent, EventBus, SharedEventBus};

// Re-export truncation
pub use truncate::{truncate_preserving, TRUNCATION_MARKER};
