use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use potiron::config::Config;
use potiron::dictionary::reverse::{annotations_for, build_reverse_index};
use potiron::export::health::HealthMetrics;
use potiron::ingest::dissector::Tshark;
use potiron::ingest::params::RunParameters;
use potiron::ingest::worker::IngestContext;
use potiron::ingest::{collect_inputs, ingest};
use potiron::route::protocols::ProtocolTable;
use potiron::route::KeyRouter;
use potiron::store::RedisStore;

/// Packet field histograms and annotation dictionaries in a shared store.
#[derive(Parser)]
#[command(name = "potiron", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest captures and annotated documents.
    Ingest(IngestArgs),
    /// Build the id to value annotation index. Run only while no ingestion
    /// is active.
    Reverse {
        #[command(flatten)]
        store: StoreArgs,
        /// Build even if files are being ingested.
        #[arg(long)]
        force: bool,
    },
    /// Show every annotation known about an object, e.g. an IP address.
    Lookup {
        object: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct StoreArgs {
    /// Store target, e.g. redis://127.0.0.1:6379/0 or unix:///run/redis.sock.
    #[arg(long)]
    store: Option<String>,
}

#[derive(Args)]
struct IngestArgs {
    /// Capture files, annotated documents, or directories to walk.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    #[command(flatten)]
    store: StoreArgs,

    /// Split histograms by protocol.
    #[arg(long)]
    combined_keys: bool,

    /// Comma separated dissector fields to extract.
    #[arg(long, value_delimiter = ',')]
    field_filter: Option<Vec<String>>,

    /// Display filter appended to the base filter.
    #[arg(long)]
    display_filter: Option<String>,

    /// Number of files processed concurrently.
    #[arg(long)]
    workers: Option<usize>,

    /// Sensor name for every input, instead of deriving it from file names.
    #[arg(long)]
    sensor: Option<String>,

    /// `name<TAB>number` protocol table replacing the built-in one.
    #[arg(long)]
    protocols_file: Option<PathBuf>,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("potiron {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Ingest(args) => run_ingest(cfg, args).await,
            Command::Reverse { store, force } => run_reverse(cfg, store, force).await,
            Command::Lookup { object, store } => run_lookup(cfg, store, &object).await,
            Command::Version => Ok(()),
        }
    })
}

impl StoreArgs {
    fn apply(self, cfg: &mut Config) {
        if let Some(url) = self.store {
            cfg.store.url = url;
        }
    }
}

impl IngestArgs {
    fn apply(self, cfg: &mut Config) -> Vec<PathBuf> {
        self.store.apply(cfg);
        if self.combined_keys {
            cfg.ingest.combined_keys = true;
        }
        if let Some(fields) = self.field_filter {
            cfg.ingest.field_filter = fields
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
        }
        if let Some(filter) = self.display_filter {
            cfg.ingest.display_filter = filter;
        }
        if let Some(workers) = self.workers {
            cfg.ingest.workers = workers;
        }
        if let Some(sensor) = self.sensor {
            cfg.ingest.sensor = sensor;
        }
        if let Some(path) = self.protocols_file {
            cfg.ingest.protocols_file = Some(path);
        }
        self.inputs
    }
}

async fn run_ingest(mut cfg: Config, args: IngestArgs) -> Result<()> {
    let inputs = args.apply(&mut cfg);
    cfg.validate().context("validating configuration")?;
    let files = collect_inputs(&inputs)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        files = files.len(),
        "starting potiron ingest",
    );

    let params = RunParameters::from_config(&cfg)?;
    let protocols = match &cfg.ingest.protocols_file {
        Some(path) => ProtocolTable::load(path)?,
        None => ProtocolTable::default(),
    };
    let router = KeyRouter::new(params.mode, protocols);
    let sensor = Some(cfg.ingest.sensor.trim().to_string()).filter(|s| !s.is_empty());
    let ctx = Arc::new(IngestContext::new(params, router, sensor, cfg.ingest.claim_ttl));

    let store = RedisStore::connect(&cfg.store).await?;
    let dissector = Arc::new(Tshark::new(cfg.dissector.program.clone()));

    let metrics = if cfg.health.enabled {
        let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        metrics.start().await?;
        Some(metrics)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = ingest(
        store,
        dissector,
        ctx,
        files,
        cfg.ingest.workers,
        cancel,
        metrics.clone(),
    )
    .await;

    if let Some(metrics) = &metrics {
        metrics.stop().await?;
    }

    let summary = result?;
    if !summary.is_success() {
        for (file, error) in &summary.failed {
            eprintln!("{}: {error}", file.display());
        }
        bail!("{} of the input files failed", summary.failed.len());
    }
    if summary.cancelled > 0 {
        bail!("interrupted with {} files not started", summary.cancelled);
    }

    Ok(())
}

async fn run_reverse(mut cfg: Config, args: StoreArgs, force: bool) -> Result<()> {
    args.apply(&mut cfg);
    if cfg.store.url.is_empty() {
        bail!("--store or store.url is required");
    }

    let store = RedisStore::connect(&cfg.store).await?;
    let report = build_reverse_index(&store, force).await?;
    println!(
        "reverse index built: {} keys, {} entries",
        report.keys, report.entries
    );
    Ok(())
}

async fn run_lookup(mut cfg: Config, args: StoreArgs, object: &str) -> Result<()> {
    args.apply(&mut cfg);
    if cfg.store.url.is_empty() {
        bail!("--store or store.url is required");
    }

    let store = RedisStore::connect(&cfg.store).await?;
    let annotations = annotations_for(&store, object).await?;
    if annotations.is_empty() {
        println!("{object}: no annotations");
    }
    for annotation in annotations {
        println!(
            "{object}\t{}\t{}\t{}\t{}",
            annotation.kind,
            annotation.field,
            annotation.id,
            annotation.value.as_deref().unwrap_or("(reverse index not built)"),
        );
    }
    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM. Files already in flight finish.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("received SIGINT, finishing in-flight files");
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, finishing in-flight files");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("received SIGINT, finishing in-flight files");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT, finishing in-flight files");
        }

        cancel.cancel();
    });
}
