use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use collagefs::config::Config;
use collagefs::daemon::Engine;
use collagefs::daemon::integrity::BrokenFilePolicy;
use collagefs::daemon::signal::spawn_signal_handler;
use collagefs::vfs::{Credentials, FileType, VfsError};

#[derive(Parser)]
#[command(name = "collagefs", version, about = "CollageFS engine CLI")]
struct Cli {
    /// Path of the JSON config file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the index file from the config.
    #[arg(long, value_name = "FILE")]
    index_file: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine and keep persisting the index until interrupted.
    Serve(ServeArgs),
    /// Report files whose chunks never reached the remote.
    Check,
    /// Copy a local file into the filesystem.
    Import {
        #[arg(value_name = "LOCAL")]
        local: PathBuf,
        #[arg(value_name = "PATH")]
        path: String,
    },
    /// Copy a file out of the filesystem.
    Export {
        #[arg(value_name = "PATH")]
        path: String,
        #[arg(value_name = "LOCAL")]
        local: PathBuf,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// What to do with files that reference never-uploaded chunks.
    #[arg(long, value_enum, default_value_t = BrokenFilePolicy::Abort)]
    on_broken: BrokenFilePolicy,
}

fn current_owner() -> Credentials {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Credentials::new(uid, gid)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("collagefs=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    if let Some(index_file) = cli.index_file {
        config.index_file = index_file;
    }

    let backend = config.backend.connect(config.max_chunk_size).await;
    let engine = Engine::start(backend, config.engine_options(current_owner())).await?;

    match cli.cmd {
        Command::Serve(args) => serve(engine, args, config.shutdown_signal_threshold).await,
        Command::Check => check(engine).await,
        Command::Import { local, path } => import(engine, local, &path).await,
        Command::Export { path, local } => export(engine, &path, local).await,
    }
}

async fn serve(engine: Engine, args: ServeArgs, signal_threshold: usize) -> anyhow::Result<()> {
    let report = engine.check(args.on_broken)?;
    if !report.is_clean() {
        warn!(broken = report.broken.len(), policy = ?args.on_broken, "started with broken files");
    }

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_handler(shutdown.clone(), signal_threshold);
    info!("serving, interrupt to stop");
    engine.run_until(shutdown).await;
    signals.abort();
    engine.shutdown().await?;
    Ok(())
}

async fn check(engine: Engine) -> anyhow::Result<()> {
    let report = engine.integrity_report();
    for p in &report.broken {
        println!("{p}");
    }
    if !report.is_clean() {
        anyhow::bail!("{} broken file(s)", report.broken.len());
    }
    println!("index is consistent");
    Ok(())
}

async fn import(engine: Engine, local: PathBuf, path: &str) -> anyhow::Result<()> {
    let data = tokio::fs::read(&local)
        .await
        .with_context(|| format!("reading {}", local.display()))?;
    let fs = engine.fs().clone();
    match fs.create(path, 0o644, current_owner()).await {
        Ok(_) => {}
        Err(VfsError::AlreadyExists { .. }) => fs.truncate(path, 0).await?,
        Err(e) => return Err(e.into()),
    }
    let piece = fs.layout().max_chunk_size as usize;
    let mut offset = 0u64;
    for part in data.chunks(piece.max(1)) {
        fs.write(path, offset, part).await?;
        offset += part.len() as u64;
    }
    info!(path, bytes = offset, "imported");
    engine.shutdown().await?;
    Ok(())
}

async fn export(engine: Engine, path: &str, local: PathBuf) -> anyhow::Result<()> {
    let fs = engine.fs().clone();
    let attr = fs.getattr(path).await?;
    if attr.kind != FileType::File {
        anyhow::bail!("{path} is a directory");
    }
    let piece = fs.layout().max_chunk_size;
    let mut out = Vec::with_capacity(attr.size as usize);
    let mut offset = 0u64;
    while offset < attr.size {
        let len = piece.min(attr.size - offset) as usize;
        let bytes = fs.read(path, offset, len).await?;
        if bytes.is_empty() {
            break;
        }
        offset += bytes.len() as u64;
        out.extend_from_slice(&bytes);
    }
    tokio::fs::write(&local, &out)
        .await
        .with_context(|| format!("writing {}", local.display()))?;
    info!(path, bytes = out.len(), "exported");
    engine.shutdown().await?;
    Ok(())
}
