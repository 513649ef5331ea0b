//! Model gateway — role-based routing to backends with bounded
//! concurrency, timeouts, retries, and cancellation.
//!
//! Each backend gets a FIFO semaphore sized from configuration. Every
//! call observes the request deadline and cancellation token; queued
//! callers that would miss the deadline fail fast with `Saturated` so
//! the generator pool can return fewer variants instead of waiting.
//! Transient failures retry with exponential backoff plus deterministic
//! jitter, bounded to three retries.

pub mod backend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use foundry::config::{BackendConfig, LlmConfig};
use foundry::EngineError;

pub use backend::{BackendError, CompletionBackend, CompletionRequest, CompletionResponse, HttpBackend};

/// Bounded retries on transient errors.
const MAX_RETRIES: u32 = 3;

/// Base backoff, doubling per retry.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Fallback context window when no tier declares one for a model.
const DEFAULT_CONTEXT_WINDOW: u32 = 8_192;

/// Abstract model role. Resolved to a concrete backend model at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Fast,
    Base,
    Powerful,
    God,
    Embedding,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Base => "base",
            Self::Powerful => "powerful",
            Self::God => "god",
            Self::Embedding => "embedding",
        }
    }

    /// Next tier in the repair escalation chain.
    pub fn escalate(&self) -> Option<ModelRole> {
        match self {
            Self::Fast => Some(Self::Base),
            Self::Base => Some(Self::Powerful),
            Self::Powerful => Some(Self::God),
            Self::God | Self::Embedding => None,
        }
    }

    /// Relative cost units per call, for the execution record.
    pub fn cost_units(&self) -> f64 {
        match self {
            Self::Fast => 0.2,
            Self::Base => 1.0,
            Self::Powerful => 4.0,
            Self::God => 10.0,
            Self::Embedding => 0.05,
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generation request addressed by role.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub role: ModelRole,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
}

/// Gateway-level error.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("backend '{backend}' error: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("backend '{0}' saturated within the request deadline")]
    Saturated(String),

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("no backend configured for role '{0}'")]
    UnknownRole(String),
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Cancelled => EngineError::CancelRequested("gateway call".into()),
            GatewayError::DeadlineExceeded => {
                EngineError::CancelRequested("deadline exceeded".into())
            }
            GatewayError::Saturated(backend) => EngineError::BackendUnavailable {
                backend,
                reason: "saturated within deadline".into(),
            },
            GatewayError::Backend { backend, source } => EngineError::BackendUnavailable {
                backend,
                reason: source.to_string(),
            },
            GatewayError::UnknownRole(role) => {
                EngineError::Config(format!("no backend for role '{role}'"))
            }
        }
    }
}

struct BackendHandle {
    backend: Arc<dyn CompletionBackend>,
    /// FIFO permit queue bounding in-flight calls.
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

/// The gateway.
pub struct ModelGateway {
    backends: HashMap<String, BackendHandle>,
    default_backend: String,
    /// role name → concrete model id.
    role_models: HashMap<&'static str, String>,
    /// model id → declared context window.
    context_windows: HashMap<String, u32>,
}

impl ModelGateway {
    /// Build from the llm configuration section.
    pub fn from_config(
        llm: &LlmConfig,
        model_tiers: &std::collections::BTreeMap<
            String,
            std::collections::BTreeMap<String, foundry::config::TierSpec>,
        >,
    ) -> Result<Self, EngineError> {
        let mut backends = HashMap::new();
        if llm.backends.is_empty() {
            // No explicit wiring: the default backend on its defaults.
            let config = BackendConfig::default();
            backends.insert(
                llm.backend.clone(),
                Self::handle_from(&llm.backend, &config)?,
            );
        }
        for (name, config) in &llm.backends {
            if !config.enabled {
                continue;
            }
            backends.insert(name.clone(), Self::handle_from(name, config)?);
        }
        if !backends.contains_key(&llm.backend) {
            return Err(EngineError::Config(format!(
                "default backend '{}' is not enabled",
                llm.backend
            )));
        }

        let mut context_windows = HashMap::new();
        for group in model_tiers.values() {
            for tier in group.values() {
                context_windows.insert(tier.model.clone(), tier.context_window);
            }
        }

        let role_models = HashMap::from([
            ("fast", llm.model_roles.fast.clone()),
            ("base", llm.model_roles.base.clone()),
            ("powerful", llm.model_roles.powerful.clone()),
            ("god", llm.model_roles.god.clone()),
            ("embedding", llm.model_roles.embedding.clone()),
        ]);

        Ok(Self {
            backends,
            default_backend: llm.backend.clone(),
            role_models,
            context_windows,
        })
    }

    fn handle_from(name: &str, config: &BackendConfig) -> Result<BackendHandle, EngineError> {
        Ok(BackendHandle {
            backend: Arc::new(HttpBackend::from_config(name, config)?),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    /// Test/bench constructor over an arbitrary backend implementation.
    pub fn single_backend(
        name: &str,
        backend: Arc<dyn CompletionBackend>,
        max_concurrent: usize,
        timeout: Duration,
        roles: &foundry::config::ModelRoles,
    ) -> Self {
        let mut backends = HashMap::new();
        backends.insert(
            name.to_string(),
            BackendHandle {
                backend,
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                timeout,
            },
        );
        Self {
            backends,
            default_backend: name.to_string(),
            role_models: HashMap::from([
                ("fast", roles.fast.clone()),
                ("base", roles.base.clone()),
                ("powerful", roles.powerful.clone()),
                ("god", roles.god.clone()),
                ("embedding", roles.embedding.clone()),
            ]),
            context_windows: HashMap::new(),
        }
    }

    /// Declared context window for the model serving a role.
    pub fn context_window(&self, role: ModelRole) -> u32 {
        self.role_models
            .get(role.as_str())
            .and_then(|model| self.context_windows.get(model))
            .copied()
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    /// Probe every backend; `(name, error)` pairs for unreachable ones.
    pub async fn check_backends(&self) -> Vec<(String, Result<(), String>)> {
        let mut results = Vec::new();
        for (name, handle) in &self.backends {
            let result = handle
                .backend
                .health_check()
                .await
                .map_err(|e| e.to_string());
            results.push((name.clone(), result));
        }
        results.sort_by(|(a, _), (b, _)| a.cmp(b));
        results
    }

    /// Generate a completion for a role-addressed request.
    ///
    /// `request_id` identifies the originating engine request; retry
    /// jitter is derived from it so concurrent requests decorrelate.
    pub async fn generate(
        &self,
        request_id: &str,
        req: &GenerateRequest,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<CompletionResponse, GatewayError> {
        let model = self
            .role_models
            .get(req.role.as_str())
            .cloned()
            .ok_or_else(|| GatewayError::UnknownRole(req.role.as_str().into()))?;
        let handle = self
            .backends
            .get(&self.default_backend)
            .ok_or_else(|| GatewayError::UnknownRole(req.role.as_str().into()))?;

        let completion = CompletionRequest {
            model,
            system: req.system.clone(),
            prompt: req.prompt.clone(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            seed: req.seed,
        };
        self.call_with_retry(request_id, handle, &self.default_backend, cancel, deadline, |b| {
            let completion = completion.clone();
            async move { b.complete(&completion).await }
        })
        .await
    }

    /// Embed texts with the embedding role.
    pub async fn embed(
        &self,
        request_id: &str,
        texts: &[String],
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Vec<Vec<f32>>, GatewayError> {
        let model = self
            .role_models
            .get("embedding")
            .cloned()
            .ok_or_else(|| GatewayError::UnknownRole("embedding".into()))?;
        let handle = self
            .backends
            .get(&self.default_backend)
            .ok_or_else(|| GatewayError::UnknownRole("embedding".into()))?;

        let texts = texts.to_vec();
        self.call_with_retry(request_id, handle, &self.default_backend, cancel, deadline, |b| {
            let model = model.clone();
            let texts = texts.clone();
            async move { b.embed(&model, &texts).await }
        })
        .await
    }

    /// Acquire a permit, then run the call under timeout/cancel/retry.
    #[allow(clippy::too_many_arguments)]
    async fn call_with_retry<T, F, Fut>(
        &self,
        request_id: &str,
        handle: &BackendHandle,
        backend_name: &str,
        cancel: &CancellationToken,
        deadline: Instant,
        mut call: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut(Arc<dyn CompletionBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        // Queue for a permit, but never past the deadline.
        let _permit = tokio::select! {
            permit = handle.semaphore.acquire() => {
                permit.map_err(|_| GatewayError::Saturated(backend_name.to_string()))?
            }
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(GatewayError::Saturated(backend_name.to_string()));
            }
        };

        let mut attempt = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::DeadlineExceeded);
            }
            let call_timeout = handle.timeout.min(remaining);

            let result = tokio::select! {
                result = tokio::time::timeout(call_timeout, call(Arc::clone(&handle.backend))) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(BackendError::Timeout(call_timeout)),
                    }
                }
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.transient() && attempt < MAX_RETRIES => {
                    let backoff = backoff_with_jitter(request_id, attempt);
                    warn!(
                        request = request_id,
                        backend = backend_name,
                        attempt,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient backend error, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(GatewayError::DeadlineExceeded);
                        }
                    }
                }
                Err(err) => {
                    debug!(backend = backend_name, error = %err, "backend call failed");
                    return Err(GatewayError::Backend {
                        backend: backend_name.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

/// Exponential backoff with deterministic jitter derived from hashing
/// `(request_id, attempt)`, so concurrent requests retrying against the
/// same backend decorrelate without a PRNG dependency.
fn backoff_with_jitter(request_id: &str, attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let hash = blake3::hash(format!("{request_id}:{attempt}").as_bytes());
    let jitter_ms = u64::from(hash.as_bytes()[0]) % (BACKOFF_BASE.as_millis() as u64);
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Stub backend with scripted failures.
    struct FlakyBackend {
        failures_before_success: AtomicU32,
    }

    #[async_trait::async_trait]
    impl CompletionBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(
            &self,
            req: &CompletionRequest,
        ) -> Result<CompletionResponse, BackendError> {
            if self.failures_before_success.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| n.checked_sub(1),
            ).is_ok()
            {
                return Err(BackendError::Status {
                    code: 429,
                    body: "slow down".into(),
                });
            }
            Ok(CompletionResponse {
                text: format!("echo: {}", req.prompt),
                prompt_tokens: 1,
                completion_tokens: 1,
            })
        }

        async fn embed(
            &self,
            _model: &str,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, BackendError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        async fn health_check(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn gateway(failures: u32) -> ModelGateway {
        ModelGateway::single_backend(
            "flaky",
            Arc::new(FlakyBackend {
                failures_before_success: AtomicU32::new(failures),
            }),
            2,
            Duration::from_secs(5),
            &foundry::config::ModelRoles::default(),
        )
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            role: ModelRole::Base,
            system: None,
            prompt: "hello".into(),
            temperature: 0.2,
            max_tokens: 128,
            seed: Some(7),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried() {
        let gw = gateway(2);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let response = gw
            .generate("req-1", &request(), &cancel, deadline)
            .await
            .unwrap();
        assert_eq!(response.text, "echo: hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_bounded() {
        // More failures than the retry budget allows.
        let gw = gateway(MAX_RETRIES + 2);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(120);
        let err = gw
            .generate("req-1", &request(), &cancel, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_released_promptly() {
        let gw = gateway(100);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(600);
        cancel.cancel();
        let err = gw
            .generate("req-1", &request(), &cancel, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_queue_wait() {
        let gw = gateway(0);
        let cancel = CancellationToken::new();

        // Saturate both permits with slow holders.
        struct Slow;
        #[async_trait::async_trait]
        impl CompletionBackend for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn complete(
                &self,
                _req: &CompletionRequest,
            ) -> Result<CompletionResponse, BackendError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
            async fn embed(
                &self,
                _model: &str,
                _texts: &[String],
            ) -> Result<Vec<Vec<f32>>, BackendError> {
                unreachable!()
            }
            async fn health_check(&self) -> Result<(), BackendError> {
                Ok(())
            }
        }
        let slow = ModelGateway::single_backend(
            "slow",
            Arc::new(Slow),
            1,
            Duration::from_secs(7200),
            &foundry::config::ModelRoles::default(),
        );
        let slow = Arc::new(slow);

        let holder = {
            let slow = Arc::clone(&slow);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(7200);
                let _ = slow.generate("req-holder", &request(), &cancel, deadline).await;
            })
        };
        // Let the holder take the only permit.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = slow
            .generate("req-queued", &request(), &cancel, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Saturated(_)));
        drop(gw);
        holder.abort();
    }

    #[tokio::test]
    async fn test_embed_round_trip() {
        let gw = gateway(0);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let vectors = gw
            .embed("req-1", &["a".into(), "b".into()], &cancel, deadline)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
    }

    #[test]
    fn test_role_escalation_chain() {
        assert_eq!(ModelRole::Base.escalate(), Some(ModelRole::Powerful));
        assert_eq!(ModelRole::Powerful.escalate(), Some(ModelRole::God));
        assert_eq!(ModelRole::God.escalate(), None);
    }

    #[test]
    fn test_backoff_jitter_from_request_identity() {
        // Deterministic for a fixed (request_id, attempt).
        assert_eq!(
            backoff_with_jitter("req-1", 1),
            backoff_with_jitter("req-1", 1)
        );
        // Jitter stays within one backoff base above the exponential
        // floor, and the floor doubles per attempt.
        let first = backoff_with_jitter("req-1", 0);
        assert!(first >= BACKOFF_BASE);
        assert!(first < BACKOFF_BASE * 2);
        assert!(backoff_with_jitter("req-1", 2) >= BACKOFF_BASE * 4);
    }

    #[tokio::test]
    async fn test_check_backends_with_mock() {
        let mut mock = backend::MockCompletionBackend::new();
        mock.expect_name().return_const("mock".to_string());
        mock.expect_health_check()
            .times(1)
            .returning(|| Err(BackendError::Connect("refused".into())));

        let gw = ModelGateway::single_backend(
            "mock",
            Arc::new(mock),
            1,
            Duration::from_secs(1),
            &foundry::config::ModelRoles::default(),
        );
        let results = gw.check_backends().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_err());
    }
}
