//! Wires the session service, WebSocket server and idle sweeper together.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use ferry_server::{ServerConfig, UploadHandler, UploadServer};
use ferry_sessions::{UploadSessionService, run_sweeper};
use ferry_transfer::ChunkStore;
use tokio_util::sync::CancellationToken;

use crate::config::ServerSettings;

/// Runs the server until Ctrl-C or a fatal server error.
pub async fn run(settings: ServerSettings) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let bind: IpAddr = settings
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", settings.bind))?;

    let auth = settings.authenticator();
    if auth.is_empty() {
        tracing::warn!("no tokens configured; every client will be rejected");
    }
    for (zone, root) in &settings.zones {
        tracing::info!(zone, root = %root.display(), "storage zone");
    }

    // -- Sessions --
    let store = ChunkStore::open(&settings.scratch_dir)
        .await
        .with_context(|| format!("opening scratch dir {}", settings.scratch_dir.display()))?;
    let service = Arc::new(
        UploadSessionService::open(
            store,
            Arc::new(settings.policy.clone()),
            Arc::new(settings.resolver()),
            settings.limits(),
        )
        .await?,
    );
    tracing::info!(sessions = service.registry().len(), "session service ready");

    // -- Idle sweeper --
    let sweeper = tokio::spawn(run_sweeper(
        Arc::clone(&service),
        settings.sweep_interval(),
        settings.idle_timeout(),
        cancel.child_token(),
    ));

    // -- WS server --
    let handler = UploadHandler::new(Arc::clone(&service), Arc::new(auth));
    let server = UploadServer::new(
        ServerConfig {
            bind,
            port: settings.port,
        },
        handler,
    );
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        result = &mut server_task => {
            cancel.cancel();
            let _ = sweeper.await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("upload server failed"),
                Err(e) => Err(e).context("upload server task panicked"),
            };
        }
    }

    // -- Graceful shutdown --
    server.shutdown();
    cancel.cancel();
    let _ = server_task.await;
    let _ = sweeper.await;
    Ok(())
}
