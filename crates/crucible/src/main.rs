//! Crucible CLI.
//!
//! Setup and I/O plumbing flow as `anyhow::Result` with context; the
//! classified `EngineError` underneath is recovered by downcast to pick
//! the exit code. Exit codes: 0 success, 2 user error, 3 backend
//! unreachable, 4 test failure after the full retry budget, 5 storage
//! error.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crucible::orchestrator::{EngineRequest, ExecutionMode, Orchestrator};
use crucible::{BackgroundOptimizer, ModelGateway};
use foundry::artifact::quality::QualityEvidence;
use foundry::records::RecordLog;
use foundry::runner::SandboxRunner;
use foundry::{ArtifactStore, EngineConfig, EngineError, ErrorKind, EventBus, FixCache, ToolRegistry};

const EXIT_OK: i32 = 0;
const EXIT_USER: i32 = 2;
const EXIT_BACKEND: i32 = 3;
const EXIT_TESTS: i32 = 4;
const EXIT_STORAGE: i32 = 5;

#[derive(Parser)]
#[command(name = "crucible", about = "Self-improving code-generation engine")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "crucible.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify backend reachability and required models.
    Check,
    /// Run the full pipeline for a task.
    Generate {
        /// Request id, echoed into records.
        id: String,
        /// Short task title.
        title: String,
        /// Task description.
        desc: String,
        /// Widen the pool and deadline for offline optimization.
        #[arg(long)]
        optimize: bool,
    },
    /// Invoke a stored artifact by id or namespace.
    Run {
        id: String,
        /// JSON input document; defaults to `{}`.
        #[arg(long)]
        input: Option<String>,
    },
    /// Force a re-score of a stored artifact.
    Evaluate { id: String },
    /// Enumerate namespaces and their promoted heads.
    List,
    /// Wipe the store. Destructive; requires confirmation.
    Clear {
        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    crucible::telemetry::init_tracing();
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

/// Map a boundary failure onto the CLI exit-code contract by recovering
/// the classified engine error underneath the context chain.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(engine) => match engine.kind() {
            ErrorKind::Backend => EXIT_BACKEND,
            ErrorKind::Storage => EXIT_STORAGE,
            ErrorKind::Runtime | ErrorKind::Timeout | ErrorKind::WrongOutput => EXIT_TESTS,
            _ => EXIT_USER,
        },
        None => EXIT_USER,
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Check => check(&config).await,
        Command::Generate {
            id,
            title,
            desc,
            optimize,
        } => generate(&config, id, title, desc, optimize).await,
        Command::Run { id, input } => run_artifact(&config, &id, input).await,
        Command::Evaluate { id } => evaluate(&config, &id).await,
        Command::List => list(&config),
        Command::Clear { yes } => clear(&config, yes),
    }
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    EngineConfig::load(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<ArtifactStore>> {
    let store = ArtifactStore::open(&config.store.path, config.store.embedding_dim)
        .map_err(EngineError::from)
        .with_context(|| format!("opening artifact store at {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

fn build_gateway(config: &EngineConfig) -> anyhow::Result<Arc<ModelGateway>> {
    let gateway = ModelGateway::from_config(&config.llm, &config.model_tiers)
        .context("building model gateway")?;
    Ok(Arc::new(gateway))
}

async fn check(config: &EngineConfig) -> anyhow::Result<i32> {
    let gateway = build_gateway(config)?;
    let results = gateway.check_backends().await;
    let mut ok = true;
    for (name, result) in &results {
        match result {
            Ok(()) => println!("backend {name}: reachable"),
            Err(e) => {
                ok = false;
                println!("backend {name}: UNREACHABLE ({e})");
            }
        }
    }
    Ok(if ok { EXIT_OK } else { EXIT_BACKEND })
}

async fn generate(
    config: &EngineConfig,
    id: String,
    title: String,
    desc: String,
    optimize: bool,
) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let gateway = build_gateway(config)?;
    let events = EventBus::new().shared();
    let fixes = FixCache::open(
        config.store.path.join("fixes"),
        config.autofix.age_decay_enabled,
    )
    .map_err(EngineError::from)
    .context("opening fix cache")?;
    let registry = Arc::new(load_registry(config, &events));
    let records = Arc::new(RecordLog::at_path(
        config.store.path.join("records").join("execution.log"),
    ));

    // The optimizer runs for the lifetime of the engine process.
    let optimizer_cancel = CancellationToken::new();
    let optimizer_handle = BackgroundOptimizer::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&records),
        Arc::clone(&events),
        Duration::from_secs(config.background.interval.max(1)),
    )
    .spawn(optimizer_cancel.clone());

    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::clone(&store),
        Arc::new(fixes),
        registry,
        gateway,
        records,
        events,
    );

    let request = EngineRequest {
        request_id: id,
        task_text: format!("{title}: {desc}"),
        mode: if optimize {
            ExecutionMode::Optimize
        } else {
            ExecutionMode::Interactive
        },
        timeout_ms: None,
    };
    let response = orchestrator.handle(request).await;

    optimizer_cancel.cancel();
    let _ = optimizer_handle.await;

    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{response:?}"),
    }
    Ok(match &response.error {
        None => EXIT_OK,
        Some(report) => match report.error_kind {
            ErrorKind::Backend => EXIT_BACKEND,
            ErrorKind::Storage => EXIT_STORAGE,
            ErrorKind::Runtime | ErrorKind::Timeout | ErrorKind::WrongOutput => EXIT_TESTS,
            _ => EXIT_USER,
        },
    })
}

async fn run_artifact(
    config: &EngineConfig,
    id: &str,
    input: Option<String>,
) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let Some(artifact) = store.get(id).or_else(|| store.head(id)) else {
        eprintln!("no artifact or namespace '{id}'");
        return Ok(EXIT_USER);
    };
    let input = input.unwrap_or_else(|| "{}".to_string());
    if serde_json::from_str::<serde_json::Value>(&input).is_err() {
        eprintln!("--input is not valid JSON");
        return Ok(EXIT_USER);
    }

    let runner = SandboxRunner::default();
    let outcome = runner
        .run(&artifact.source, input.as_bytes(), &config.default_limits())
        .await
        .map_err(|e| EngineError::BackendUnavailable {
            backend: "sandbox".into(),
            reason: e.to_string(),
        })
        .with_context(|| format!("running artifact {}", artifact.id))?;
    let _ = store.update_usage(&artifact.id);

    print!("{}", String::from_utf8_lossy(&outcome.stdout));
    if !outcome.stderr.is_empty() {
        eprint!("{}", outcome.stderr_text());
    }
    Ok(if outcome.success() { EXIT_OK } else { EXIT_TESTS })
}

async fn evaluate(config: &EngineConfig, id: &str) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let Some(artifact) = store.get(id).or_else(|| store.head(id)) else {
        eprintln!("no artifact or namespace '{id}'");
        return Ok(EXIT_USER);
    };

    let runner = SandboxRunner::default();
    let outcome = runner
        .run(&artifact.source, b"{}", &config.default_limits())
        .await
        .map_err(|e| EngineError::BackendUnavailable {
            backend: "sandbox".into(),
            reason: e.to_string(),
        })
        .with_context(|| format!("running artifact {}", artifact.id))?;

    let evidence = if outcome.success() && outcome.output_json().is_some() {
        QualityEvidence::pass(
            artifact
                .test_results
                .as_ref()
                .map(|t| t.coverage)
                .unwrap_or(1.0),
        )
    } else {
        QualityEvidence::fail(foundry::Severity::Medium)
    };
    let score = store
        .update_quality(&artifact.id, &evidence)
        .map_err(EngineError::from)
        .context("recording the re-score")?;
    println!("{} quality {score:.3}", artifact.id);
    Ok(if evidence.test_pass { EXIT_OK } else { EXIT_TESTS })
}

fn list(config: &EngineConfig) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let heads = store.heads();
    if heads.is_empty() {
        println!("store is empty");
        return Ok(EXIT_OK);
    }
    for (namespace, head_id) in heads {
        match store.get(&head_id) {
            Some(artifact) => println!(
                "{namespace}  v{}  q={:.2}  uses={}  {}",
                artifact.version, artifact.quality_score, artifact.usage_count, artifact.id
            ),
            None => println!("{namespace}  {head_id}  (missing artifact)"),
        }
    }
    Ok(EXIT_OK)
}

fn clear(config: &EngineConfig, yes: bool) -> anyhow::Result<i32> {
    if !yes {
        print!(
            "wipe the store at {} — type 'yes' to confirm: ",
            config.store.path.display()
        );
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() || line.trim() != "yes" {
            eprintln!("aborted");
            return Ok(EXIT_USER);
        }
    }
    let store = open_store(config)?;
    store
        .clear()
        .map_err(EngineError::from)
        .context("wiping the store")?;
    info!("store cleared");
    Ok(EXIT_OK)
}

/// Tool descriptors load from `tools.toml` next to the store when
/// present; otherwise the registry starts empty and selection simply
/// finds no tools.
fn load_registry(config: &EngineConfig, events: &foundry::SharedEventBus) -> ToolRegistry {
    match try_load_registry(config, events) {
        Ok(Some(registry)) => registry,
        Ok(None) => ToolRegistry::new(foundry::ToolSet::default(), 0.40, Some(Arc::clone(events))),
        Err(err) => {
            eprintln!("ignoring invalid tools file: {err:#}");
            ToolRegistry::new(foundry::ToolSet::default(), 0.40, Some(Arc::clone(events)))
        }
    }
}

fn try_load_registry(
    config: &EngineConfig,
    events: &foundry::SharedEventBus,
) -> anyhow::Result<Option<ToolRegistry>> {
    let path = config.store.path.join("tools.toml");
    if !path.exists() {
        return Ok(None);
    }
    ToolRegistry::load_file(&path, 0.40, Some(Arc::clone(events)))
        .map(Some)
        .with_context(|| format!("loading tool descriptors from {}", path.display()))
}
