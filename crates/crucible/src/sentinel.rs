//! Interrupt sentinel.
//!
//! When a user interrupt arrives mid-request, a short policy call on the
//! fast role decides whether to cancel, let the request finish, or queue
//! the new input as a follow-up. The sentinel has its own tight deadline;
//! if it cannot decide in time, the default is cancel — releasing
//! resources promptly beats finishing speculative work.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{GenerateRequest, ModelGateway, ModelRole};

/// Sentinel decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptDecision {
    Cancel,
    LetFinish,
    QueueFollowUp,
}

const SENTINEL_DEADLINE: Duration = Duration::from_secs(2);

const SENTINEL_SYSTEM: &str = "A running code-generation request was interrupted \
by its user. Decide what to do. Answer with exactly one word: cancel (stop and \
release resources), finish (the request is nearly done and worth completing), \
or queue (treat the interruption as a follow-up to run after this request).";

pub struct InterruptSentinel {
    gateway: Arc<ModelGateway>,
}

impl InterruptSentinel {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Decide how to handle an interrupt to `request_id`. Never blocks
    /// past its own deadline.
    pub async fn decide(
        &self,
        request_id: &str,
        request_summary: &str,
        progress_summary: &str,
    ) -> InterruptDecision {
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + SENTINEL_DEADLINE;
        let request = GenerateRequest {
            role: ModelRole::Fast,
            system: Some(SENTINEL_SYSTEM.to_string()),
            prompt: format!("Request: {request_summary}\nProgress: {progress_summary}\n"),
            temperature: 0.0,
            max_tokens: 8,
            seed: Some(0),
        };
        match self.gateway.generate(request_id, &request, &cancel, deadline).await {
            Ok(response) => {
                let decision = parse_decision(&response.text);
                debug!(?decision, "sentinel decided");
                decision
            }
            Err(err) => {
                warn!(error = %err, "sentinel unavailable, defaulting to cancel");
                InterruptDecision::Cancel
            }
        }
    }
}

fn parse_decision(text: &str) -> InterruptDecision {
    let lowered = text.to_lowercase();
    if lowered.contains("finish") {
        InterruptDecision::LetFinish
    } else if lowered.contains("queue") {
        InterruptDecision::QueueFollowUp
    } else {
        InterruptDecision::Cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::backend::{
        BackendError, CompletionBackend, CompletionRequest, CompletionResponse,
    };

    struct Fixed(&'static str);

    #[async_trait::async_trait]
    impl CompletionBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn complete(
            &self,
            _req: &CompletionRequest,
        ) -> Result<CompletionResponse, BackendError> {
            if self.0 == "ERROR" {
                return Err(BackendError::Connect("down".into()));
            }
            Ok(CompletionResponse {
                text: self.0.to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
            })
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

    fn sentinel(reply: &'static str) -> InterruptSentinel {
        let gateway = ModelGateway::single_backend(
            "fixed",
            Arc::new(Fixed(reply)),
            1,
            Duration::from_secs(2),
            &foundry::config::ModelRoles::default(),
        );
        InterruptSentinel::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_decisions_parsed() {
        assert_eq!(
            sentinel("finish").decide("req-1", "task", "90%").await,
            InterruptDecision::LetFinish
        );
        assert_eq!(
            sentinel("queue it").decide("req-1", "task", "10%").await,
            InterruptDecision::QueueFollowUp
        );
        assert_eq!(
            sentinel("cancel").decide("req-1", "task", "10%").await,
            InterruptDecision::Cancel
        );
        assert_eq!(
            sentinel("gibberish").decide("req-1", "task", "10%").await,
            InterruptDecision::Cancel
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_defaults_to_cancel() {
        assert_eq!(
            sentinel("ERROR").decide("req-1", "task", "50%").await,
            InterruptDecision::Cancel
        );
    }
}
