//! Command-Line Entry Point
//!
//! Three sub-commands: `makeconfig` writes a sample configuration,
//! `model` builds and prints a depth model from a key snapshot, and
//! `audit` runs the continuous replication audit. SIGTERM cancels
//! whatever is running; a cancelled run exits 0.

use clap::{Parser, Subcommand};
use repl_audit::{AuditConfig, Auditor, Cancel, DepthModel, RetryingLister, S3Lister};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "repl-audit",
    version,
    about = "Audits bucket replication by sampling keys in two buckets and checking that they match."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a sample config file at the specified path.
    Makeconfig {
        /// Path to the JSON config file.
        #[arg(long, default_value = "config.json")]
        cfg: PathBuf,
    },
    /// Compute and print a model for the given bucket snapshot.
    Model {
        /// Path to a snapshot of the source bucket's keys: one JSON key
        /// record per line, optionally gzip'd.
        #[arg(long)]
        file: PathBuf,
    },
    /// Continuously sample keys in two buckets and check that they match.
    ///
    /// Keys to audit are picked randomly based on a model built from an
    /// existing listing of the source bucket.
    Audit {
        /// Path to the JSON config file.
        #[arg(long)]
        cfg: PathBuf,
        /// Path to a previously built model document.
        #[arg(long, conflicts_with = "build_model")]
        model: Option<PathBuf>,
        /// Path to a key snapshot to build the model from instead.
        #[arg(long)]
        build_model: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cancel = Cancel::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            warn!("received SIGTERM, aborting");
            cancel.cancel();
        });
    }

    match cli.command {
        Commands::Makeconfig { cfg } => make_config(&cfg),
        Commands::Model { file } => print_model(&file, &cancel).await,
        Commands::Audit {
            cfg,
            model,
            build_model,
        } => audit(&cfg, model, build_model, cancel).await,
    }
}

fn make_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let doc = AuditConfig::sample().to_document()?;
    std::fs::write(path, doc)?;
    info!(path = %path.display(), "wrote sample config");
    Ok(())
}

async fn print_model(file: &Path, cancel: &Cancel) -> Result<(), Box<dyn std::error::Error>> {
    let model = DepthModel::from_snapshot(file, None, cancel).await?;
    println!("{}", model.to_document()?);
    Ok(())
}

async fn audit(
    cfg_path: &Path,
    model_path: Option<PathBuf>,
    build_model: Option<PathBuf>,
    cancel: Cancel,
) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = AuditConfig::load(File::open(cfg_path)?)?;

    let model = match (model_path, build_model) {
        (_, Some(snapshot)) => {
            DepthModel::from_snapshot(&snapshot, Some(cfg.source.bucket.clone()), &cancel).await?
        }
        (Some(path), None) => DepthModel::from_reader(File::open(path)?)?,
        (None, None) => return Err("audit requires either --model or --build-model".into()),
    };

    let source = Arc::new(RetryingLister::new(S3Lister::open(&cfg.source)?));
    let destination = Arc::new(RetryingLister::new(S3Lister::open(&cfg.destination)?));

    Auditor::new(cfg, Arc::new(model), source, destination, cancel)
        .run()
        .await;
    Ok(())
}
