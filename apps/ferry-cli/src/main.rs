//! `ferry`: upload files to a Ferry server, resuming where a previous run
//! left off.

mod commands;
mod config;
mod scanner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ferry_protocol::messages::HelloRequest;
use ferry_queue::QueueConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ferry", version, about = "Resumable chunked uploads")]
struct Args {
    /// Client configuration file.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Server URL, e.g. ws://nas.local:7420.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Access token.
    #[arg(long, global = true, env = "FERRY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Parallel uploads.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload files and directories.
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Storage zone on the server.
        #[arg(long)]
        zone: Option<String>,
        /// Folder inside the zone.
        #[arg(long)]
        path: Option<String>,
    },
    /// Pick up interrupted uploads; only missing chunks are sent.
    Resume {
        paths: Vec<PathBuf>,
        #[arg(long)]
        zone: Option<String>,
        #[arg(long)]
        path: Option<String>,
    },
    /// List your open upload sessions.
    Sessions,
    /// Delete an open upload session.
    Cancel { session_id: String },
}

/// Configuration file merged with command-line overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    pub token: String,
    pub zone: String,
    pub queue: QueueConfig,
}

impl Settings {
    pub fn hello(&self) -> HelloRequest {
        HelloRequest {
            token: self.token.clone(),
            client_name: format!("ferry-cli/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let path = args.config.unwrap_or_else(config::default_path);
    let file = config::ClientConfig::load(&path)?;
    let mut settings = Settings {
        url: args.url.unwrap_or(file.url),
        token: args.token.unwrap_or(file.token),
        zone: file.zone,
        queue: file.queue,
    };
    if let Some(concurrency) = args.concurrency {
        settings.queue.concurrency = concurrency;
    }
    if settings.token.is_empty() {
        anyhow::bail!("no token configured; pass --token or set it in {}", path.display());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(args.command, settings))
}
