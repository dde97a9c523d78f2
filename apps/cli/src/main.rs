//! chunkstash command-line entry point.

mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chunkstash_engine::{
    ChunkedDownloadCoordinator, FlatBackend, HttpFlatBackend, MemoryFlatBackend, StorageRouter,
    UploadRequest,
};
use chunkstash_store::{GithubStore, MemoryObjectStore, ObjectStore};
use chunkstash_transfer::{
    FileRecord, ProgressSink, StorageTarget, TransferPhase, TransferProgress, UploadManifest,
    chunk_path, plan,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "chunkstash")]
#[command(about = "Store large files in a git object store as atomic chunk sets")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, global = true, env = "CHUNKSTASH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files and print their records as JSON
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Send to the flat backend instead of the git store
        #[arg(long, default_value_t = false)]
        flat: bool,
        /// Use in-memory backends; nothing leaves the process
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// MIME type for every file (guessed from the extension if unset)
        #[arg(long)]
        mime_type: Option<String>,
    },
    /// Rebuild a file from its stored record
    Download {
        /// JSON file holding the record printed by `upload`
        #[arg(long)]
        record: PathBuf,
        /// Where to write the file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Remove a stored file from the backend its record names
    Delete {
        /// JSON file holding the record printed by `upload`
        #[arg(long)]
        record: PathBuf,
    },
    /// Print how a file of the given size would be chunked
    Plan {
        /// Source size in bytes
        #[arg(long)]
        size: u64,
        /// Chunk size in bytes (defaults to the configured size)
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Destination path the chunk paths derive from
        #[arg(long, default_value = "files/example.bin")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling transfer");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Upload {
            files,
            flat,
            dry_run,
            mime_type,
        } => upload(&config, files, flat, dry_run, mime_type, cancel).await,
        Commands::Download { record, output } => download(&config, &record, &output, cancel).await,
        Commands::Delete { record } => delete(&config, &record, cancel).await,
        Commands::Plan {
            size,
            chunk_size,
            path,
        } => print_plan(size, chunk_size.unwrap_or(config.engine.chunk_size), &path),
    }
}

async fn upload(
    config: &CliConfig,
    files: Vec<PathBuf>,
    flat: bool,
    dry_run: bool,
    mime_type: Option<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let requests = upload_requests(files, mime_type.as_deref())?;

    let (store, flat_backend): (Box<dyn ObjectStore>, Option<Box<dyn FlatBackend>>) = if dry_run {
        (
            Box::new(MemoryObjectStore::with_ref(&config.engine.ref_name)) as Box<dyn ObjectStore>,
            Some(Box::new(MemoryFlatBackend::default()) as Box<dyn FlatBackend>),
        )
    } else {
        let flat_backend = match &config.flat {
            Some(flat) => Some(Box::new(HttpFlatBackend::new(flat)?) as Box<dyn FlatBackend>),
            None => None,
        };
        (
            Box::new(GithubStore::new(&config.github, config.engine.committer.clone())?) as Box<dyn ObjectStore>,
            flat_backend,
        )
    };

    let target = if flat {
        StorageTarget::Flat
    } else {
        StorageTarget::ChunkCapable
    };
    if target == StorageTarget::Flat && flat_backend.is_none() {
        bail!("--flat needs a [flat] section in the config file");
    }

    let mut router = StorageRouter::new(store.as_ref(), &config.engine, cancel);
    if let Some(flat) = flat_backend.as_deref() {
        router = router.with_flat(flat);
    }

    let (sink, reporter) = progress_reporter();
    let result = router.route(requests, target, &sink).await;
    drop(sink);
    let _ = reporter.await;
    let result = result?;

    tracing::info!(
        files = result.records.len(),
        commits = result.commits.len(),
        backend = store.backend_name(),
        "upload finished"
    );
    println!("{}", serde_json::to_string_pretty(&result.records)?);
    Ok(())
}

/// Builds one request per file, guessing the MIME type from the extension
/// unless one is given.
fn upload_requests(files: Vec<PathBuf>, mime_type: Option<&str>) -> Result<Vec<UploadRequest>> {
    files
        .into_iter()
        .map(|path| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .with_context(|| format!("{} has no usable file name", path.display()))?;
            let mime_type = match mime_type {
                Some(mime) => mime.to_string(),
                None => mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string(),
            };
            Ok(UploadRequest::new(path, name, mime_type))
        })
        .collect()
}

fn read_record(path: &Path) -> Result<FileRecord> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing record {}", path.display()))
}

async fn download(
    config: &CliConfig,
    record: &Path,
    output: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    let record = read_record(record)?;
    let manifest = UploadManifest::from_record(&record)?;

    let store = GithubStore::new(&config.github, config.engine.committer.clone())?;
    let coordinator = ChunkedDownloadCoordinator::new(&store, &config.engine, cancel);

    let (sink, reporter) = progress_reporter();
    let result = coordinator.download_to_path(&manifest, output, &sink).await;
    drop(sink);
    let _ = reporter.await;
    let written = result?;

    tracing::info!(path = %output.display(), bytes = written, "download finished");
    Ok(())
}

async fn delete(config: &CliConfig, record: &Path, cancel: CancellationToken) -> Result<()> {
    let record = read_record(record)?;
    let store = GithubStore::new(&config.github, config.engine.committer.clone())?;
    let flat_backend = config.flat.as_ref().map(HttpFlatBackend::new).transpose()?;

    let mut router = StorageRouter::new(&store, &config.engine, cancel);
    if let Some(flat) = &flat_backend {
        router = router.with_flat(flat);
    }
    let deleted = router.delete(&record).await?;
    println!("{}", serde_json::to_string_pretty(&deleted)?);
    Ok(())
}

fn print_plan(size: u64, chunk_size: u64, path: &str) -> Result<()> {
    chunkstash_engine::config::validate_chunk_size(chunk_size)?;
    let regions = plan(size, chunk_size)?;
    let chunked = regions.len() > 1;
    for region in &regions {
        let object = if chunked {
            chunk_path(path, region.index)
        } else {
            path.to_string()
        };
        println!(
            "{:>4}  {:>12}  {:>12}  {object}",
            region.index, region.offset, region.length
        );
    }
    Ok(())
}

/// Creates a progress sink and a task that logs each phase change.
fn progress_reporter() -> (ProgressSink, tokio::task::JoinHandle<()>) {
    let (sink, mut rx) = ProgressSink::channel(64);
    let handle = tokio::spawn(async move {
        let mut last: Option<TransferPhase> = None;
        while let Some(TransferProgress { percent, phase }) = rx.recv().await {
            if last != Some(phase) {
                tracing::info!(%phase, percent = percent.round(), "progress");
                last = Some(phase);
            } else {
                tracing::debug!(%phase, percent, "progress");
            }
        }
    });
    (sink, handle)
}
