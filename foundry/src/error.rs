//! Engine error taxonomy.
//!
//! One enum covers every failure class that crosses a subsystem boundary.
//! Boundary calls retry transient errors once with backoff; structural
//! errors (schema, validation, cancellation) are never retried. Stack
//! traces stay in the logs — callers get a `FailureReport`.

use serde::{Deserialize, Serialize};

/// Classified error kind, used in failure logs, fix signatures, and
/// user-visible reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source failed to parse or balance.
    Syntax,
    /// Import/module resolution failure (circular self-import, missing module).
    Import,
    /// Artifact crashed at runtime (nonzero exit, traceback).
    Runtime,
    /// Artifact ran but produced the wrong output.
    WrongOutput,
    /// Wall-clock limit exceeded.
    Timeout,
    /// Memory cap exceeded.
    MemoryOverrun,
    /// A static validator rejected the source.
    Validator,
    /// A model or embedding backend was unreachable.
    Backend,
    /// Persistent store failure.
    Storage,
    /// Cooperative cancellation.
    Cancelled,
    /// A safety cap was exceeded before execution.
    Constraint,
    /// Anything unclassified.
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Import => write!(f, "import"),
            Self::Runtime => write!(f, "runtime"),
            Self::WrongOutput => write!(f, "wrong_output"),
            Self::Timeout => write!(f, "timeout"),
            Self::MemoryOverrun => write!(f, "memory_overrun"),
            Self::Validator => write!(f, "validator"),
            Self::Backend => write!(f, "backend"),
            Self::Storage => write!(f, "storage"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Constraint => write!(f, "constraint"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Failure severity, drives quality-score demotion deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("planner failed: {0}")]
    PlannerFailed(String),

    #[error("all generators failed: {0}")]
    AllGeneratorsFailed(String),

    #[error("validator pipeline did not converge: {0}")]
    ValidatorFailed(String),

    #[error("tests unfixable after {attempts} repair attempts: {reason}")]
    TestsUnfixable { attempts: u32, reason: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage format incompatible: found version {found}, expected {expected}")]
    StorageIncompatible { found: u32, expected: u32 },

    #[error("cancelled: {0}")]
    CancelRequested(String),

    #[error("safety constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable snake_case kind for records and responses.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackendUnavailable { .. } => ErrorKind::Backend,
            Self::PlannerFailed(_) | Self::AllGeneratorsFailed(_) => ErrorKind::Backend,
            Self::ValidatorFailed(_) => ErrorKind::Validator,
            Self::TestsUnfixable { .. } => ErrorKind::Runtime,
            Self::StorageUnavailable(_) | Self::StorageIncompatible { .. } => ErrorKind::Storage,
            Self::CancelRequested(_) => ErrorKind::Cancelled,
            Self::ConstraintViolation(_) => ErrorKind::Constraint,
            Self::Config(_) => ErrorKind::Other,
        }
    }

    /// Whether a retry at the same boundary can reasonably succeed.
    ///
    /// Structural errors (validation, cancellation, constraint, config,
    /// incompatible storage) are never retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::StorageUnavailable(_)
        )
    }

    /// Convert into the user-visible failure shape.
    pub fn to_report(&self) -> FailureReport {
        let suggested_action = match self {
            Self::BackendUnavailable { .. } => "check backend reachability and credentials",
            Self::PlannerFailed(_) => "retry with a shorter or more specific task description",
            Self::AllGeneratorsFailed(_) => "retry; if persistent, check model role configuration",
            Self::ValidatorFailed(_) => "inspect the validator report in the execution record",
            Self::TestsUnfixable { .. } => "refine the task description or raise the retry budget",
            Self::StorageUnavailable(_) => "check store path permissions and disk space",
            Self::StorageIncompatible { .. } => "migrate or clear the store directory",
            Self::CancelRequested(_) => "re-submit the request",
            Self::ConstraintViolation(_) => "relax the safety caps or narrow the task",
            Self::Config(_) => "fix the configuration file",
        };
        FailureReport {
            error_kind: self.kind(),
            summary: self.to_string(),
            suggested_action: suggested_action.to_string(),
            retryable: self.retryable(),
        }
    }
}

/// User-visible failure description attached to responses.
///
/// Carries no stack traces or internal paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub error_kind: ErrorKind,
    pub summary: String,
    pub suggested_action: String,
    pub retryable: bool,
}

/// Result alias for engine-boundary operations.
pub type EngineResult<T> = Result<T, EngineError>;
