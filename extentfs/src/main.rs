use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use extentfs::source::LocalDirSource;
use extentfs::store::{FileLocalStore, LocalStore};
use extentfs::{Config, ReadDispatcher, ReadRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "extentfs", version, about = "Read remote files through the extent cache")]
struct Cli {
    /// YAML config file; the default search path is used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read a byte range of a remote file and write it to stdout.
    Read {
        /// Object key, relative to the remote directory.
        key: String,
        /// Directory that plays the remote service.
        #[arg(long)]
        remote_dir: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to read; defaults to the rest of the file.
        #[arg(long)]
        len: Option<usize>,
        /// Bypass the page cache.
        #[arg(long)]
        non_cached: bool,
        /// Read the range this many times (later rounds hit the cache).
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Local extent store; defaults to the user cache directory.
        #[arg(long)]
        cache_file: Option<PathBuf>,
    },
}

fn default_cache_file() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("extentfs")
        .join("extents.bin")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("extentfs=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_default_path()?,
    };

    match cli.command {
        Command::Read {
            key,
            remote_dir,
            offset,
            len,
            non_cached,
            repeat,
            cache_file,
        } => {
            let cache_file = cache_file.unwrap_or_else(default_cache_file);
            let store = Arc::new(FileLocalStore::create(&cache_file, None).await?);
            let source = Arc::new(LocalDirSource::new(&remote_dir));
            let dispatcher = ReadDispatcher::new(config, source, store.clone());

            let file = dispatcher
                .open(&key)
                .await
                .with_context(|| format!("open {key}"))?;
            let len = len.unwrap_or_else(|| file.size().saturating_sub(offset) as usize);
            let mut req = ReadRequest::new(offset, len).synchronous_io();
            if non_cached {
                req = req.non_cached();
            }

            let mut stdout = tokio::io::stdout();
            for round in 0..repeat.max(1) {
                let reply = dispatcher.read(&file, req).await?;
                info!(round, bytes = reply.transferred(), "read complete");
                if round == 0 {
                    stdout.write_all(&reply.data).await?;
                }
            }
            stdout.flush().await?;

            let stats = file.extents().stats();
            info!(
                populated = stats.populated_bytes,
                fetches = stats.fetches,
                retries = stats.retries,
                failures = stats.failures,
                position = file.position(),
                store = %store.path().display(),
                available = store.is_available(),
                "extent statistics"
            );
            dispatcher.close(&file);
            dispatcher.shutdown();
        }
    }
    Ok(())
}
