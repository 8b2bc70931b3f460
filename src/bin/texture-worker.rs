use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use texture_worker::{BackendKind, HttpCoordinator, WorkerConfig, WorkerPool, create_backend};

#[derive(Parser, Debug)]
#[command(name = "texture-worker", version)]
struct Cli {
    /// JSON config file; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coordinator address (`host:port` or a full URL).
    #[arg(long)]
    server: Option<String>,

    /// Number of worker slots.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Signal level a job must reach before its result is pushed.
    #[arg(long)]
    threshold: Option<i32>,

    /// Backend to use.
    #[arg(long, value_enum)]
    backend: Option<BackendChoice>,

    /// Build full mip chains for single-level payloads.
    #[arg(long)]
    generate_mips: bool,

    /// Sleep this long before pulling again after a void job.
    #[arg(long)]
    retry_backoff_ms: Option<u64>,

    /// Per-request timeout for coordinator calls.
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendChoice {
    Cpu,
    Gpu,
}

impl From<BackendChoice> for BackendKind {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Cpu => Self::Cpu,
            BackendChoice::Gpu => Self::Gpu,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<WorkerConfig> {
    let mut cfg = match &cli.config {
        Some(path) => WorkerConfig::from_json_file(path)
            .with_context(|| format!("load config '{}'", path.display()))?,
        None => WorkerConfig::default(),
    };
    if let Some(server) = &cli.server {
        cfg.server = server.clone();
    }
    if let Some(n) = cli.concurrency {
        cfg.concurrency = n;
    }
    if let Some(t) = cli.threshold {
        cfg.threshold = t;
    }
    if let Some(b) = cli.backend {
        cfg.backend = b.into();
    }
    if cli.generate_mips {
        cfg.generate_mips = true;
    }
    if cli.retry_backoff_ms.is_some() {
        cfg.retry_backoff_ms = cli.retry_backoff_ms;
    }
    if cli.request_timeout_ms.is_some() {
        cfg.request_timeout_ms = cli.request_timeout_ms;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = load_config(&cli)?;
    let backend = create_backend(&cfg).context("create compute backend")?;
    let coordinator = Arc::new(HttpCoordinator::new(&cfg)?);
    tracing::info!(
        server = %coordinator.base_url(),
        backend = backend.name(),
        slots = cfg.concurrency,
        "starting"
    );

    let pool = WorkerPool::new(cfg, backend, coordinator)?;
    let report = pool.run()?;
    tracing::info!(
        submitted = report.submitted,
        failed = report.failed,
        "done"
    );
    Ok(())
}
