//! Background optimizer — offline pass over the store.
//!
//! Runs on its own scheduler with a cancellation token per job and no
//! shared locks with the request path beyond the store's public API.
//! Each cycle promotes strictly fitter variants, and feeds tool
//! success/failure counters from execution records appended since the
//! previous cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foundry::records::RecordLog;
use foundry::{ArtifactStore, EngineEvent, SharedEventBus, ToolRegistry};

pub struct BackgroundOptimizer {
    store: Arc<ArtifactStore>,
    registry: Arc<ToolRegistry>,
    records: Arc<RecordLog>,
    events: SharedEventBus,
    interval: Duration,
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub namespaces_scanned: usize,
    pub promotions: usize,
    pub records_consumed: usize,
}

impl BackgroundOptimizer {
    pub fn new(
        store: Arc<ArtifactStore>,
        registry: Arc<ToolRegistry>,
        records: Arc<RecordLog>,
        events: SharedEventBus,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            records,
            events,
            interval,
        }
    }

    /// Spawn the periodic job. Cancel the token to stop it.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut record_cursor = 0usize;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = self.run_cycle(&mut record_cursor);
                        debug!(
                            namespaces = summary.namespaces_scanned,
                            promotions = summary.promotions,
                            records = summary.records_consumed,
                            "optimizer cycle complete"
                        );
                    }
                    _ = cancel.cancelled() => {
                        info!("background optimizer stopped");
                        return;
                    }
                }
            }
        })
    }

    /// One synchronous pass. Public so tests and the CLI can force it.
    pub fn run_cycle(&self, record_cursor: &mut usize) -> CycleSummary {
        let mut summary = CycleSummary::default();

        // Promote fitter variants. The store enforces the promotability
        // invariants; we only compare fitness.
        for (namespace, head_id) in self.store.heads() {
            summary.namespaces_scanned += 1;
            let head_quality = self
                .store
                .get(&head_id)
                .map(|a| a.quality_score)
                .unwrap_or(0.0);
            let challenger = self
                .store
                .artifacts_in_namespace(&namespace)
                .into_iter()
                .filter(|a| a.id != head_id && a.promotable())
                .max_by(|a, b| {
                    a.quality_score
                        .partial_cmp(&b.quality_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.last_used_at.cmp(&b.last_used_at))
                });
            if let Some(challenger) = challenger {
                if challenger.quality_score > head_quality {
                    match self.store.promote(&namespace, &challenger.id) {
                        Ok(outcome) => {
                            summary.promotions += 1;
                            info!(
                                namespace = namespace.as_str(),
                                artifact = challenger.id.as_str(),
                                quality = challenger.quality_score,
                                "background promotion"
                            );
                            self.events.publish(EngineEvent::ArtifactPromoted {
                                namespace: namespace.clone(),
                                artifact_id: challenger.id.clone(),
                                previous: outcome.previous,
                                at: Utc::now(),
                            });
                        }
                        Err(e) => warn!(namespace = namespace.as_str(), error = %e, "background promotion failed"),
                    }
                }
            }
        }

        // Feed tool selection data from fresh execution records.
        let fresh = self.records.tail_since(*record_cursor);
        for record in &fresh {
            if let Some(tool_id) = &record.selected_tool {
                match record.error_kind {
                    None => self.registry.record_success(tool_id),
                    Some(kind) => self.registry.record_failure(
                        tool_id,
                        Vec::new(),
                        kind,
                        foundry::Severity::Low,
                    ),
                }
            }
        }
        summary.records_consumed = fresh.len();
        *record_cursor += fresh.len();

        summary
    }
}
