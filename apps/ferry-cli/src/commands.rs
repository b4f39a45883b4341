//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use ferry_connection::ReconnectingClient;
use ferry_protocol::Destination;
use ferry_queue::{
    FileSource, QueueEvent, RestoreCoordinator, SessionApi, TransferStatus, UploadFile,
    UploadQueue,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::scanner::{self, ScannedFile};
use crate::{Command, Settings};

pub async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    let client = Arc::new(ReconnectingClient::new(
        settings.url.clone(),
        settings.hello(),
    ));
    let hello = client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", settings.url))?;
    tracing::info!(user = %hello.user, server = %hello.server_version, "connected");

    let cancel = CancellationToken::new();
    let result = match command {
        Command::Upload { paths, zone, path } => {
            let zone = zone.unwrap_or_else(|| settings.zone.clone());
            let queue = UploadQueue::new(client.clone(), settings.queue.clone());
            let files = open_sources(scanner::scan(&paths)?).await?;
            queue.add_files(files, &Destination::new(zone, path.unwrap_or_default()))?;
            drive(&queue).await
        }
        Command::Resume { paths, zone, path } => {
            let zone = zone.unwrap_or_else(|| settings.zone.clone());
            let queue = UploadQueue::new(client.clone(), settings.queue.clone());
            let restored = RestoreCoordinator::new(queue.clone())
                .restore(&cancel)
                .await?;
            println!("{} interrupted upload(s) on the server", restored.len());

            let files = open_sources(scanner::scan(&paths)?).await?;
            queue.add_files(files, &Destination::new(zone, path.unwrap_or_default()))?;

            for t in queue.snapshot() {
                if t.status == TransferStatus::Paused && !t.has_source {
                    println!("  {} {} not resumed (no local file given)", t.id, t.name);
                }
            }
            drive(&queue).await
        }
        Command::Sessions => list_sessions(client.as_ref(), &cancel).await,
        Command::Cancel { session_id } => {
            client.delete_session(&session_id, &cancel).await?;
            println!("deleted session {session_id}");
            Ok(())
        }
    };

    client.close().await;
    result
}

async fn open_sources(scanned: Vec<ScannedFile>) -> anyhow::Result<Vec<UploadFile>> {
    let mut files = Vec::with_capacity(scanned.len());
    for file in scanned {
        let source = FileSource::open(&file.local)
            .await
            .with_context(|| format!("opening {}", file.local.display()))?;
        files.push(UploadFile::new(file.relative_path, Arc::new(source)));
    }
    Ok(files)
}

/// Prints queue events until every admitted transfer settles.
async fn drive(queue: &UploadQueue) -> anyhow::Result<()> {
    let mut events = queue.subscribe();

    loop {
        tokio::select! {
            _ = queue.wait_idle() => break,
            _ = tokio::signal::ctrl_c() => {
                println!("\ninterrupted; run `ferry resume` with the same files to continue");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => report(queue, &event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "progress output lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let failed: Vec<_> = queue
        .snapshot()
        .into_iter()
        .filter(|t| t.status == TransferStatus::Failed)
        .collect();
    if !failed.is_empty() {
        for t in &failed {
            eprintln!(
                "failed: {} ({})",
                t.name,
                t.error.as_deref().unwrap_or("unknown error")
            );
        }
        bail!("{} upload(s) failed", failed.len());
    }
    Ok(())
}

fn report(queue: &UploadQueue, event: &QueueEvent) {
    let Some(t) = queue.get(event.id()) else {
        return;
    };
    match event {
        QueueEvent::Progress {
            confirmed_bytes,
            size,
            bytes_per_second,
            eta,
            ..
        } => {
            println!(
                "  {} {:>6.1}%  {} / {}  {}/s  eta {}",
                t.name,
                t.percent(),
                human_bytes(*confirmed_bytes),
                human_bytes(*size),
                human_bytes(*bytes_per_second as u64),
                eta.map(human_duration).unwrap_or_else(|| "-".into()),
            );
        }
        QueueEvent::StatusChanged { status, error, .. } => match status {
            TransferStatus::Completed => println!(
                "done: {} -> {}",
                t.name,
                t.remote_path.as_deref().unwrap_or("?")
            ),
            TransferStatus::Failed => {
                println!("error: {} ({})", t.name, error.as_deref().unwrap_or("?"))
            }
            TransferStatus::Active if t.retries > 0 => {
                println!("retrying: {} (attempt {})", t.name, t.retries + 1)
            }
            _ => {}
        },
        QueueEvent::Added { .. } | QueueEvent::Removed { .. } => {}
    }
}

async fn list_sessions(api: &dyn SessionApi, cancel: &CancellationToken) -> anyhow::Result<()> {
    let sessions = api.list_sessions(cancel).await?;
    if sessions.is_empty() {
        println!("no open sessions");
        return Ok(());
    }
    for s in sessions {
        println!(
            "{}  {}:{}/{}  {}/{} chunks  {} / {}  last active {}",
            s.session_id,
            s.destination.zone,
            s.destination.path,
            s.filename,
            s.confirmed_chunks,
            s.total_chunks,
            human_bytes(s.confirmed_bytes),
            human_bytes(s.total_size),
            s.last_activity,
        );
    }
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, secs % 3600 / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(20 * 1024 * 1024), "20.0 MiB");
    }

    #[test]
    fn durations_are_humanized() {
        assert_eq!(human_duration(Duration::from_secs(42)), "42s");
        assert_eq!(human_duration(Duration::from_secs(125)), "2m05s");
        assert_eq!(human_duration(Duration::from_secs(3 * 3600 + 60)), "3h01m");
    }
}
