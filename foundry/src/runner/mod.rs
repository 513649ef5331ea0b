//! Sandboxed runner — executes generated artifacts with resource limits.
//!
//! The artifact source is written into a scratch directory and run as a
//! child process with a cleared environment (only an explicit allowlist
//! plus caller-passed variables survive). Input is one JSON document on
//! stdin; output is one JSON document on stdout; stderr is diagnostic
//! only. Wall-clock is enforced by the runner with term→kill escalation;
//! memory is enforced when `/proc` is available and observed otherwise.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Environment variables passed through so interpreters resolve.
/// Credentials never appear here.
const ENV_PASSTHROUGH: &[&str] = &["PATH", "LANG", "TZ"];

/// Resource caps for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub wall_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,
    pub output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_ms: 600_000,
            cpu_seconds: None,
            mem_mb: None,
            output_bytes: 1_048_576,
        }
    }
}

impl ResourceLimits {
    /// Caps may only be tightened, never widened.
    pub fn tightened(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_ms: self.wall_ms.min(other.wall_ms),
            cpu_seconds: match (self.cpu_seconds, other.cpu_seconds) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            mem_mb: match (self.mem_mb, other.mem_mb) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            output_bytes: self.output_bytes.min(other.output_bytes),
        }
    }
}

/// Everything observed from one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub wall_ms: u64,
    pub peak_rss_mb: Option<u64>,
    pub cpu_ms: Option<u64>,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub stdout_truncated: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.memory_exceeded
    }

    /// Parse stdout as a JSON document.
    pub fn output_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.stdout).ok()
    }

    /// The primary result value: `result`, or any of the accepted
    /// convenience keys.
    pub fn result_value(&self) -> Option<serde_json::Value> {
        let doc = self.output_json()?;
        for key in ["result", "output", "answer", "content"] {
            if let Some(v) = doc.get(key) {
                return Some(v.clone());
            }
        }
        None
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// How an artifact's source becomes a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCommand {
    pub program: String,
    pub args: Vec<String>,
    /// File the source is written to inside the scratch directory.
    pub file_name: String,
}

impl RunCommand {
    /// Default interpreter for function artifacts.
    pub fn python() -> Self {
        Self {
            program: "python3".into(),
            args: vec!["main.py".into()],
            file_name: "main.py".into(),
        }
    }

    /// POSIX shell runner, used by hermetic tests.
    pub fn shell() -> Self {
        Self {
            program: "sh".into(),
            args: vec!["main.sh".into()],
            file_name: "main.sh".into(),
        }
    }
}

/// The sandboxed runner.
pub struct SandboxRunner {
    command: RunCommand,
    /// Extra environment, explicitly granted by the caller.
    extra_env: Vec<(String, String)>,
}

impl SandboxRunner {
    pub fn new(command: RunCommand) -> Self {
        Self {
            command,
            extra_env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.extra_env.push((key.to_string(), value.to_string()));
        self
    }

    /// Execute `source` with `input` on stdin under `limits`.
    pub async fn run(
        &self,
        source: &str,
        input: &[u8],
        limits: &ResourceLimits,
    ) -> std::io::Result<RunOutcome> {
        let scratch = tempfile::tempdir()?;
        let file_path = scratch.path().join(&self.command.file_name);
        tokio::fs::write(&file_path, source).await?;

        let mut cmd = tokio::process::Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .current_dir(scratch.path())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in ENV_PASSTHROUGH {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let mut child = cmd.spawn()?;
        let pid = child.id();

        // Feed the input document and close stdin.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input).await;
            let _ = stdin.shutdown().await;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not piped"))?;
        let stdout_task = tokio::spawn(read_capped(stdout, limits.output_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr, limits.output_bytes));

        // Resource sampler: observes peak RSS and CPU, enforces the
        // memory cap where /proc exists.
        let peak_rss_kb = Arc::new(AtomicU64::new(0));
        let cpu_ms = Arc::new(AtomicU64::new(0));
        let memory_exceeded = Arc::new(AtomicBool::new(false));
        let sampler = pid.map(|pid| {
            tokio::spawn(sample_proc(
                pid,
                limits.mem_mb,
                Arc::clone(&peak_rss_kb),
                Arc::clone(&cpu_ms),
                Arc::clone(&memory_exceeded),
            ))
        });

        let wall = Duration::from_millis(limits.wall_ms);
        let mut timed_out = false;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(wall) => None,
        };

        let status = match status {
            Some(status) => status,
            None => {
                timed_out = true;
                self.terminate(&mut child, pid).await?
            }
        };

        let wall_ms = start.elapsed().as_millis() as u64;
        if let Some(sampler) = sampler {
            sampler.abort();
            let _ = sampler.await;
        }
        // Orphaned grandchildren can keep the pipe write-end open past
        // the child's death; never wait on EOF longer than a grace
        // window once the child has been reaped.
        let (stdout, stdout_truncated) = join_reader(stdout_task).await;
        let (stderr, _) = join_reader(stderr_task).await;

        let memory_exceeded = memory_exceeded.load(Ordering::Relaxed);
        let exit_code = if timed_out {
            -1
        } else {
            status.code().unwrap_or(-1)
        };
        let peak = peak_rss_kb.load(Ordering::Relaxed);
        let cpu = cpu_ms.load(Ordering::Relaxed);

        debug!(
            exit_code,
            wall_ms,
            timed_out,
            memory_exceeded,
            stdout_bytes = stdout.len(),
            "sandbox run finished"
        );

        Ok(RunOutcome {
            stdout,
            stderr,
            exit_code,
            wall_ms,
            peak_rss_mb: (peak > 0).then_some(peak / 1024),
            cpu_ms: (cpu > 0).then_some(cpu),
            timed_out,
            memory_exceeded,
            stdout_truncated,
        })
    }

    /// Escalating shutdown: SIGTERM, grace window, SIGKILL.
    async fn terminate(
        &self,
        child: &mut tokio::process::Child,
        pid: Option<u32>,
    ) -> std::io::Result<std::process::ExitStatus> {
        if let Some(pid) = pid {
            let _ = tokio::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(?pid, "grace window elapsed, sending SIGKILL");
                child.start_kill()?;
                child.wait().await
            }
        }
    }
}

impl Default for SandboxRunner {
    fn default() -> Self {
        Self::new(RunCommand::python())
    }
}

async fn join_reader(
    task: tokio::task::JoinHandle<(Vec<u8>, bool)>,
) -> (Vec<u8>, bool) {
    match tokio::time::timeout(KILL_GRACE, task).await {
        Ok(joined) => joined.unwrap_or((Vec::new(), false)),
        Err(_) => (Vec::new(), false),
    }
}

/// Read a stream to completion, keeping at most `cap` bytes. The stream
/// is drained past the cap so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let take = n.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

/// Poll `/proc/<pid>` for RSS and CPU use; enforce the memory cap by
/// terminating the child. A no-op on hosts without procfs.
async fn sample_proc(
    pid: u32,
    mem_cap_mb: Option<u64>,
    peak_rss_kb: Arc<AtomicU64>,
    cpu_ms: Arc<AtomicU64>,
    memory_exceeded: Arc<AtomicBool>,
) {
    let status_path = format!("/proc/{pid}/status");
    let stat_path = format!("/proc/{pid}/stat");
    let mut interval = tokio::time::interval(Duration::from_millis(50));
    loop {
        interval.tick().await;
        let Ok(status) = tokio::fs::read_to_string(&status_path).await else {
            return; // process gone
        };
        if let Some(kb) = parse_vm_hwm_kb(&status) {
            peak_rss_kb.fetch_max(kb, Ordering::Relaxed);
            if let Some(cap_mb) = mem_cap_mb {
                if kb / 1024 > cap_mb && !memory_exceeded.swap(true, Ordering::Relaxed) {
                    warn!(pid, cap_mb, observed_mb = kb / 1024, "memory cap exceeded");
                    let _ = tokio::process::Command::new("kill")
                        .args(["-TERM", &pid.to_string()])
                        .status()
                        .await;
                }
            }
        }
        if let Ok(stat) = tokio::fs::read_to_string(&stat_path).await {
            if let Some(ms) = parse_cpu_ms(&stat) {
                cpu_ms.store(ms, Ordering::Relaxed);
            }
        }
    }
}

fn parse_vm_hwm_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|l| l.starts_with("VmHWM:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// utime + stime from `/proc/<pid>/stat`, assuming the conventional
/// 100 Hz clock tick.
fn parse_cpu_ms(stat: &str) -> Option<u64> {
    // Fields 14 and 15, counted after the parenthesized comm field
    // (which may itself contain parentheses, hence the rsplit).
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> SandboxRunner {
        SandboxRunner::new(RunCommand::shell())
    }

    fn fast_limits() -> ResourceLimits {
        ResourceLimits {
            wall_ms: 5_000,
            cpu_seconds: None,
            mem_mb: None,
            output_bytes: 4096,
        }
    }

    #[tokio::test]
    async fn test_stdio_round_trip() {
        let outcome = runner()
            .run(
                "read line\nprintf '{\"result\": 2}'\n",
                b"{}\n",
                &fast_limits(),
            )
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(
            outcome.result_value().unwrap(),
            serde_json::json!(2)
        );
    }

    #[tokio::test]
    async fn test_result_under_convenience_keys() {
        let outcome = runner()
            .run(
                "read line\nprintf '{\"answer\": \"ok\"}'\n",
                b"{}\n",
                &fast_limits(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result_value().unwrap(), serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_surfaced_verbatim() {
        let outcome = runner()
            .run("printf '{}' \nexit 7\n", b"{}\n", &fast_limits())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_flags() {
        let limits = ResourceLimits {
            wall_ms: 300,
            ..fast_limits()
        };
        let start = Instant::now();
        let outcome = runner()
            .run("sleep 30\n", b"{}\n", &limits)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
        // Escalation must not wait for the full sleep.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stdout_capped_and_flagged() {
        let limits = ResourceLimits {
            output_bytes: 64,
            ..fast_limits()
        };
        let outcome = runner()
            .run("i=0\nwhile [ $i -lt 200 ]; do echo 'aaaaaaaaaaaaaaaa'; i=$((i+1)); done\n", b"{}\n", &limits)
            .await
            .unwrap();
        assert!(outcome.stdout_truncated);
        assert!(outcome.stdout.len() <= 64);
    }

    #[tokio::test]
    async fn test_ambient_credentials_not_exposed() {
        std::env::set_var("CRUCIBLE_TEST_SECRET", "hunter2");
        let outcome = runner()
            .run(
                "printf '{\"result\": \"%s\"}' \"${CRUCIBLE_TEST_SECRET:-unset}\"\n",
                b"{}\n",
                &fast_limits(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.result_value().unwrap(),
            serde_json::json!("unset")
        );
        std::env::remove_var("CRUCIBLE_TEST_SECRET");
    }

    #[tokio::test]
    async fn test_explicit_env_is_exposed() {
        let outcome = SandboxRunner::new(RunCommand::shell())
            .with_env("GRANTED", "yes")
            .run(
                "printf '{\"result\": \"%s\"}' \"$GRANTED\"\n",
                b"{}\n",
                &fast_limits(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result_value().unwrap(), serde_json::json!("yes"));
    }

    #[test]
    fn test_limits_tightened_only_downward() {
        let base = ResourceLimits::default();
        let tighter = ResourceLimits {
            wall_ms: 1_000,
            cpu_seconds: Some(5),
            mem_mb: Some(64),
            output_bytes: 10_000_000,
        };
        let merged = base.tightened(&tighter);
        assert_eq!(merged.wall_ms, 1_000);
        assert_eq!(merged.cpu_seconds, Some(5));
        assert_eq!(merged.mem_mb, Some(64));
        // The wider output cap does not loosen the base.
        assert_eq!(merged.output_bytes, base.output_bytes);
    }

    #[test]
    fn test_parse_vm_hwm() {
        let status = "Name:\tpython3\nVmHWM:\t  204800 kB\nVmRSS:\t 1024 kB\n";
        assert_eq!(parse_vm_hwm_kb(status), Some(204800));
    }

    #[test]
    fn test_parse_cpu_ms() {
        let stat = "1234 (py (weird) name) S 1 2 3 4 5 6 7 8 9 10 250 150 0 0";
        assert_eq!(parse_cpu_ms(stat), Some(4000));
    }
}
