//! Ferry upload server entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ferry-server", version, about = "Resumable chunked upload server")]
struct Args {
    /// Configuration file (created with defaults if missing).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Overrides the configured port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting ferry server");

    let path = args.config.unwrap_or_else(config::default_path);
    let mut settings = config::ServerSettings::load_or_create(&path)?;
    if let Some(port) = args.port {
        settings.port = port;
    }
    tracing::info!(path = %path.display(), port = settings.port, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(settings))?;

    tracing::info!("server shut down cleanly");
    Ok(())
}
