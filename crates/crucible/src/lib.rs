//! Crucible — a self-improving code-generation engine.
//!
//! Given a natural-language task, the engine plans, generates, tests,
//! repairs, and stores executable artifacts, reusing and improving them
//! across invocations. Code is the authoritative representation;
//! artifacts are ranked by measured execution outcomes, never by model
//! self-report.
//!
//! This crate holds the networked half of the system: the model and
//! embedding gateways, the overseer planner, the parallel generator
//! pool, the repair cycle, the interrupt sentinel, the orchestrator, and
//! the background optimizer. The deterministic half (store, validators,
//! runner, evaluator, classifier) lives in `foundry`.

pub mod embedding;
pub mod gateway;
pub mod genpool;
pub mod invoker;
pub mod optimizer;
pub mod orchestrator;
pub mod planner;
pub mod repair;
pub mod sentinel;
pub mod telemetry;

// Re-export gateway types
pub use gateway::{
    CompletionBackend, CompletionRequest, CompletionResponse, GatewayError, GenerateRequest,
    HttpBackend, ModelGateway, ModelRole,
};

// Re-export embedding gateway
pub use embedding::EmbeddingGateway;

// Re-export planner types
pub use planner::{Overseer, SafetyCaps, SpecField, TaskSpec, TestCase};

// Re-export generator pool types
pub use genpool::{combined_score, default_generators, GenConfig, GeneratorPool, Variant};

// Re-export repair types
pub use repair::{derive_patch, escalation_roles, RepairBudget};

// Re-export tool invocation
pub use invoker::ToolInvoker;

// Re-export sentinel types
pub use sentinel::{InterruptDecision, InterruptSentinel};

// Re-export orchestrator types
pub use orchestrator::{EngineRequest, EngineResponse, ExecutionMode, Orchestrator};

// Re-export optimizer
pub use optimizer::BackgroundOptimizer;
