//! Execution records — append-only ledger of generation attempts.
//!
//! One JSON line per handled request, written to `records/execution.log`.
//! The background optimizer reads these to feed tool selection data.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classifier::ReuseDecision;
use crate::error::ErrorKind;

/// Recent records kept in memory for the optimizer.
const MEMORY_TAIL: usize = 1024;

/// One generation attempt inside a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub generator: String,
    pub validators_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_pass: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_score: Option<f64>,
    pub latency_ms: u64,
}

/// One handled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub request_id: String,
    pub task_hash: String,
    pub classifier_decision: ReuseDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_tool: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_artifact_id: Option<String>,
    pub wall_time_ms: u64,
    /// Rough cost proxy: model calls weighted by role tier.
    pub cost_units: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// True when the store served this request memory-only.
    pub degraded: bool,
    pub at: DateTime<Utc>,
}

/// Stable hash of a task description.
pub fn task_hash(task_text: &str) -> String {
    format!(
        "task-{}",
        &blake3::hash(task_text.trim().as_bytes()).to_hex()[..24]
    )
}

/// Append-only record log with an in-memory tail.
pub struct RecordLog {
    path: Option<PathBuf>,
    tail: RwLock<Vec<ExecutionRecord>>,
}

impl RecordLog {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tail: RwLock::new(Vec::new()),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            tail: RwLock::new(Vec::new()),
        }
    }

    /// Append one record. Disk failures are logged, never surfaced — the
    /// ledger is advisory, not load-bearing for the request.
    pub fn append(&self, record: ExecutionRecord) {
        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &record) {
                warn!(error = %e, "failed to append execution record");
            }
        }
        if let Ok(mut tail) = self.tail.write() {
            tail.push(record);
            if tail.len() > MEMORY_TAIL {
                let drop = tail.len() - MEMORY_TAIL;
                tail.drain(..drop);
            }
        }
    }

    /// Records appended since the given sequence index.
    pub fn tail_since(&self, index: usize) -> Vec<ExecutionRecord> {
        self.tail
            .read()
            .map(|tail| tail.iter().skip(index).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tail.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the full on-disk log (optimizer startup).
    pub fn load_all(path: &Path) -> std::io::Result<Vec<ExecutionRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => out.push(record),
                Err(e) => warn!(error = %e, "skipping malformed execution record"),
            }
        }
        Ok(out)
    }
}

fn append_line(path: &Path, record: &ExecutionRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let json = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(file, "{json}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            request_id: request_id.into(),
            task_hash: task_hash("add 1 plus 1"),
            classifier_decision: ReuseDecision::Different,
            selected_tool: None,
            attempts: vec![AttemptRecord {
                generator: "gen-base-0".into(),
                validators_ok: true,
                test_pass: Some(true),
                evaluator_score: Some(0.9),
                latency_ms: 1200,
            }],
            final_artifact_id: Some("art-abc".into()),
            wall_time_ms: 4000,
            cost_units: 2.0,
            error_kind: None,
            degraded: false,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_task_hash_stable_and_trimmed() {
        assert_eq!(task_hash("add 1 plus 1"), task_hash("  add 1 plus 1\n"));
        assert_ne!(task_hash("add 1 plus 1"), task_hash("sum 1 and 1"));
    }

    #[test]
    fn test_append_and_tail() {
        let log = RecordLog::in_memory();
        log.append(record("r1"));
        log.append(record("r2"));
        assert_eq!(log.len(), 2);
        let since = log.tail_since(1);
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].request_id, "r2");
    }

    #[test]
    fn test_jsonl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records").join("execution.log");
        let log = RecordLog::at_path(&path);
        log.append(record("r1"));
        log.append(record("r2"));

        let loaded = RecordLog::load_all(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].request_id, "r1");
        assert_eq!(loaded[1].attempts.len(), 1);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.log");
        std::fs::write(&path, "not json\n").unwrap();
        let log = RecordLog::at_path(&path);
        log.append(record("r1"));

        let loaded = RecordLog::load_all(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let loaded = RecordLog::load_all(Path::new("/nonexistent/execution.log")).unwrap();
        assert!(loaded.is_empty());
    }
}
