//! Per-transfer upload driver.
//!
//! One task per admitted transfer. A chunked run asks the server which
//! chunks it still lacks, sends only those (in index order) and
//! finalizes. Retryable failures loop back to that question, so a
//! dropped connection costs at most the chunk in flight.

use std::sync::Arc;

use ferry_protocol::Destination;
use ferry_protocol::messages::CreateSessionRequest;
use ferry_transfer::{ChunkBitmap, ChunkLayout, RateSampler, checksum_bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::queue::{Inner, progress_event};
use crate::source::ByteSource;
use crate::types::{SessionRef, TransferId, TransferMode};

/// Snapshot of an admitted transfer handed to its worker.
pub(crate) struct Job {
    pub id: TransferId,
    pub generation: u64,
    pub name: String,
    pub size: u64,
    pub destination: Destination,
    pub mode: TransferMode,
    pub source: Arc<dyn ByteSource>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Completed { remote_path: String },
    Failed(ApiError),
    /// Paused, cancelled or removed while running.
    Interrupted,
}

pub(crate) async fn run(inner: Arc<Inner>, job: Job) {
    debug!(transfer = %job.id, name = %job.name, mode = ?job.mode, "worker started");
    let outcome = drive(&inner, &job).await;
    inner.finish(&job, outcome);
}

async fn drive(inner: &Inner, job: &Job) -> Outcome {
    let mut sampler = RateSampler::new(Some(inner.config.progress_interval()));
    let mut attempt = 0u32;

    loop {
        let result = match job.mode {
            TransferMode::SingleShot => single_shot(inner, job, &mut sampler).await,
            TransferMode::Chunked => chunked(inner, job, &mut sampler).await,
        };
        let err = match result {
            Ok(remote_path) => return Outcome::Completed { remote_path },
            Err(e) => e,
        };

        if job.cancel.is_cancelled() {
            return Outcome::Interrupted;
        }
        if !should_retry(job.mode, &err) || attempt >= inner.config.max_retries {
            return Outcome::Failed(err);
        }

        attempt += 1;
        warn!(transfer = %job.id, attempt, error = %err, "upload attempt failed, retrying");
        let message = err.to_string();
        inner.update(job, |t| {
            t.retries = attempt;
            t.error = Some(message);
            t.bytes_per_second = 0.0;
            t.eta = None;
            None
        });

        let delay = inner.config.retry_backoff() * attempt;
        tokio::select! {
            _ = job.cancel.cancelled() => return Outcome::Interrupted,
            _ = tokio::time::sleep(delay) => {}
        }
        sampler.reset();
    }
}

/// Whole-file uploads have no session to lose, so only transport and
/// server faults are worth another try.
fn should_retry(mode: TransferMode, err: &ApiError) -> bool {
    match mode {
        TransferMode::Chunked => err.is_retryable(),
        TransferMode::SingleShot => matches!(
            err,
            ApiError::NetworkInterrupted(_)
                | ApiError::Server { .. }
                | ApiError::ChecksumMismatch(_)
                | ApiError::SizeMismatch(_)
        ),
    }
}

fn source_error(e: std::io::Error) -> ApiError {
    ApiError::Source(e.to_string())
}

/// Sends the whole file in one request. Progress counts bytes handed to
/// the transport; the server confirms nothing until the reply.
async fn single_shot(
    inner: &Inner,
    job: &Job,
    sampler: &mut RateSampler,
) -> Result<String, ApiError> {
    let data = job
        .source
        .read_range(0, job.size)
        .await
        .map_err(source_error)?;

    sampler.record(0);
    inner.update(job, |t| {
        t.confirmed_bytes = 0;
        Some(progress_event(t))
    });
    let sampler = std::sync::Mutex::new(sampler);
    let on_sent = |sent: u64| {
        let sent = sent.min(job.size);
        let (rate, eta) = {
            let mut sampler = sampler.lock().unwrap_or_else(|e| e.into_inner());
            let rate = sampler.record(sent);
            (rate, sampler.eta(job.size - sent))
        };
        inner.update(job, |t| {
            t.confirmed_bytes = sent;
            t.bytes_per_second = rate;
            t.eta = eta;
            Some(progress_event(t))
        });
    };

    let resp = inner
        .api
        .store_file(&job.name, &job.destination, data, &on_sent, &job.cancel)
        .await?;
    Ok(resp.path)
}

async fn chunked(
    inner: &Inner,
    job: &Job,
    sampler: &mut RateSampler,
) -> Result<String, ApiError> {
    let (session, mut missing) = open_session(inner, job).await?;

    let layout = ChunkLayout::new(job.size, session.chunk_size)
        .map_err(|e| ApiError::Protocol(e.to_string()))?;
    if layout.total_chunks() != session.total_chunks {
        return Err(ApiError::Protocol(format!(
            "session {} has {} chunks, file needs {}",
            session.id,
            session.total_chunks,
            layout.total_chunks()
        )));
    }

    let total = layout.total_chunks();
    missing.sort_unstable();
    missing.dedup();
    missing.retain(|&i| i < total);

    let mut bitmap = ChunkBitmap::new(total);
    for index in 0..total {
        if missing.binary_search(&index).is_err() {
            bitmap.set(index);
        }
    }
    let mut confirmed = layout.bytes_for(bitmap.present());
    sampler.record(confirmed);

    let snapshot = bitmap.clone();
    inner.update(job, |t| {
        t.confirmed_bytes = confirmed;
        t.chunks = Some(snapshot);
        Some(progress_event(t))
    });
    debug!(
        transfer = %job.id,
        session = %session.id,
        missing = missing.len(),
        total,
        "sending missing chunks"
    );

    for index in missing {
        if job.cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let len = layout
            .chunk_len(index)
            .ok_or_else(|| ApiError::Protocol(format!("chunk {index} out of range")))?;
        let data = job
            .source
            .read_range(layout.offset(index), len)
            .await
            .map_err(source_error)?;
        let checksum = checksum_bytes(&data);
        inner
            .api
            .send_chunk(&session.id, index, data, checksum, &job.cancel)
            .await?;

        bitmap.set(index);
        confirmed = (confirmed + len).min(job.size);
        let rate = sampler.record(confirmed);
        let eta = sampler.eta(job.size - confirmed);
        let snapshot = bitmap.clone();
        let live = inner.update(job, |t| {
            t.confirmed_bytes = confirmed;
            t.chunks = Some(snapshot);
            t.bytes_per_second = rate;
            t.eta = eta;
            Some(progress_event(t))
        });
        if !live {
            return Err(ApiError::Cancelled);
        }
    }

    let resp = inner.api.finalize(&session.id, &job.cancel).await?;
    info!(transfer = %job.id, session = %session.id, path = %resp.path, "session finalized");
    Ok(resp.path)
}

/// Returns the session to upload into and the chunks it still lacks.
///
/// An existing session the server no longer knows is dropped and a new
/// one created; confirmed progress restarts from zero.
async fn open_session(inner: &Inner, job: &Job) -> Result<(SessionRef, Vec<u32>), ApiError> {
    if let Some(session) = inner.session_of(job) {
        match inner.api.missing_chunks(&session.id, &job.cancel).await {
            Ok(missing) => return Ok((session, missing)),
            Err(ApiError::NotFound(_)) => {
                info!(transfer = %job.id, session = %session.id, "server lost session, starting over");
                inner.update(job, |t| {
                    t.session = None;
                    t.chunks = None;
                    t.confirmed_bytes = 0;
                    Some(progress_event(t))
                });
            }
            Err(e) => return Err(e),
        }
    }

    let req = CreateSessionRequest {
        filename: job.name.clone(),
        total_size: job.size,
        destination: job.destination.clone(),
        chunk_size: Some(inner.config.chunk_size),
    };
    let resp = inner.api.create_session(req, &job.cancel).await?;
    let session = SessionRef {
        id: resp.session_id,
        chunk_size: resp.chunk_size,
        total_chunks: resp.total_chunks,
    };
    info!(
        transfer = %job.id,
        session = %session.id,
        chunk_size = session.chunk_size,
        total_chunks = session.total_chunks,
        "session created"
    );

    if !inner.bind_session(job, session.clone()) {
        // Cancelled or removed mid-request: nobody owns the session now.
        let cancel = CancellationToken::new();
        if let Err(e) = inner.api.delete_session(&session.id, &cancel).await {
            warn!(session = %session.id, error = %e, "failed to delete orphaned session");
        }
        return Err(ApiError::Cancelled);
    }

    Ok((session.clone(), (0..session.total_chunks).collect()))
}
