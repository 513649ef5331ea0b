//! Embedding gateway — synchronous text→vector requests.
//!
//! Thin wrapper over the model gateway's embedding role that pins the
//! vector dimension the store was opened with. Dimension drift (a
//! swapped embedding model) is a configuration error, not data.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use foundry::EngineError;

use crate::gateway::ModelGateway;

pub struct EmbeddingGateway {
    gateway: Arc<ModelGateway>,
    dim: usize,
}

impl EmbeddingGateway {
    pub fn new(gateway: Arc<ModelGateway>, dim: usize) -> Self {
        Self { gateway, dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embed one text. Errors map to `BackendUnavailable`; callers that
    /// can proceed without reuse (the classifier) treat that as "no
    /// embedding".
    pub async fn embed_one(
        &self,
        request_id: &str,
        text: &str,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Vec<f32>, EngineError> {
        let mut vectors = self
            .gateway
            .embed(request_id, &[text.to_string()], cancel, deadline)
            .await
            .map_err(EngineError::from)?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EngineError::BackendUnavailable {
                backend: "embedding".into(),
                reason: "empty embedding response".into(),
            })?;
        if vector.len() != self.dim {
            return Err(EngineError::Config(format!(
                "embedding dimension mismatch: backend returned {}, store expects {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(vector)
    }

    /// A zero vector of the store dimension, used when an artifact must
    /// be stored while the embedding backend is down. Zero never matches
    /// any query, so degraded artifacts simply stay invisible to reuse.
    pub fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.dim]
    }
}
