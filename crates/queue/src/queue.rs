//! Upload queue: transfer bookkeeping, admission control and user actions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use ferry_protocol::{Destination, SessionSummary};
use ferry_transfer::split_relative_path;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::SessionApi;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::source::ByteSource;
use crate::types::{
    QueueEvent, SessionRef, Transfer, TransferId, TransferMode, TransferStatus, UploadFile,
};
use crate::worker::{self, Job, Outcome};

/// Broadcast buffer; slow observers lag instead of blocking workers.
const EVENT_BUFFER: usize = 1024;

/// Client-side upload queue.
///
/// Cheap to clone; all clones share the same transfers.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) api: Arc<dyn SessionApi>,
    pub(crate) config: QueueConfig,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

#[derive(Default)]
struct QueueState {
    transfers: BTreeMap<TransferId, Entry>,
    /// Queued ids in admission order. May hold stale ids; they are
    /// skipped when popped.
    pending: VecDeque<TransferId>,
    /// Worker tasks currently running.
    running: usize,
    next_id: u64,
}

struct Entry {
    transfer: Transfer,
    source: Option<Arc<dyn ByteSource>>,
    cancel: Option<CancellationToken>,
    /// Bumped on every worker start; stale workers cannot write.
    generation: u64,
}

impl UploadQueue {
    /// Creates a queue over `api`. Frame sizes in `config` above the
    /// WebSocket message limit are lowered to it.
    pub fn new(api: Arc<dyn SessionApi>, config: QueueConfig) -> Self {
        let clamped = config.clone().clamped();
        if clamped != config {
            warn!(
                chunk_size = clamped.chunk_size,
                chunked_threshold = clamped.chunked_threshold,
                "queue frame sizes lowered to the message limit"
            );
        }
        let config = clamped;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                state: Mutex::new(QueueState::default()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub(crate) fn api(&self) -> &Arc<dyn SessionApi> {
        &self.inner.api
    }

    /// Subscribes to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Queues files for upload to `destination`.
    ///
    /// Directories in a file's relative path are appended to the
    /// destination path. A file matching a restored placeholder by leaf
    /// name and size is bound to that placeholder instead of creating a
    /// new transfer.
    pub fn add_files(
        &self,
        files: Vec<UploadFile>,
        destination: &Destination,
    ) -> Result<Vec<TransferId>, QueueError> {
        let mut prepared = Vec::with_capacity(files.len());
        for file in files {
            let (name, prefix) = split_relative_path(&file.relative_path)?;
            prepared.push((name, destination.join(&prefix), file.source));
        }

        let threshold = self.inner.config.chunked_threshold;
        let mut ids = Vec::with_capacity(prepared.len());
        let mut events = Vec::new();
        {
            let mut st = self.inner.lock();
            for (name, dest, source) in prepared {
                let size = source.len();

                if let Some(id) = st.find_placeholder(&name, size) {
                    if let Some(entry) = st.transfers.get_mut(&id) {
                        entry.source = Some(source);
                        entry.transfer.has_source = true;
                        entry.transfer.status = TransferStatus::Queued;
                        entry.transfer.error = None;
                        events.push(status_event(&entry.transfer));
                    }
                    st.pending.push_back(id);
                    info!(transfer = %id, name = %name, size, "file bound to restored session");
                    ids.push(id);
                    continue;
                }

                st.next_id += 1;
                let id = TransferId(st.next_id);
                let mode = if size > 0 && size >= threshold {
                    TransferMode::Chunked
                } else {
                    TransferMode::SingleShot
                };
                let transfer = Transfer {
                    id,
                    name,
                    size,
                    destination: dest,
                    status: TransferStatus::Queued,
                    mode,
                    confirmed_bytes: 0,
                    bytes_per_second: 0.0,
                    eta: None,
                    session: None,
                    chunks: None,
                    error: None,
                    retries: 0,
                    remote_path: None,
                    has_source: true,
                };
                debug!(transfer = %id, name = %transfer.name, size, ?mode, "transfer queued");
                st.transfers.insert(
                    id,
                    Entry {
                        transfer,
                        source: Some(source),
                        cancel: None,
                        generation: 0,
                    },
                );
                st.pending.push_back(id);
                events.push(QueueEvent::Added { id });
                ids.push(id);
            }
        }

        self.inner.emit(events);
        self.inner.pump();
        Ok(ids)
    }

    /// Stops a queued or active transfer, keeping its confirmed chunks.
    pub fn pause(&self, id: TransferId) -> Result<(), QueueError> {
        let event = {
            let mut st = self.inner.lock();
            let entry = st.entry_mut(id)?;
            match entry.transfer.status {
                TransferStatus::Queued | TransferStatus::Active => {
                    if let Some(cancel) = entry.cancel.take() {
                        cancel.cancel();
                    }
                    entry.transfer.status = TransferStatus::Paused;
                    entry.transfer.bytes_per_second = 0.0;
                    entry.transfer.eta = None;
                    status_event(&entry.transfer)
                }
                TransferStatus::Paused => return Ok(()),
                status => return Err(QueueError::InvalidState { id, status }),
            }
        };
        info!(transfer = %id, "transfer paused");
        self.inner.emit(vec![event]);
        Ok(())
    }

    /// Re-queues a paused transfer. Fails with
    /// [`QueueError::NoByteSource`] for placeholders without a file.
    pub fn resume(&self, id: TransferId) -> Result<(), QueueError> {
        let event = {
            let mut st = self.inner.lock();
            let entry = st.entry_mut(id)?;
            match entry.transfer.status {
                TransferStatus::Paused => {
                    if entry.source.is_none() {
                        return Err(QueueError::NoByteSource(id));
                    }
                    entry.transfer.status = TransferStatus::Queued;
                    let event = status_event(&entry.transfer);
                    st.pending.push_back(id);
                    event
                }
                TransferStatus::Queued | TransferStatus::Active => return Ok(()),
                status => return Err(QueueError::InvalidState { id, status }),
            }
        };
        info!(transfer = %id, "transfer resumed");
        self.inner.emit(vec![event]);
        self.inner.pump();
        Ok(())
    }

    /// Aborts a transfer and deletes its server session (best effort).
    pub fn cancel(&self, id: TransferId) -> Result<(), QueueError> {
        let (events, session) = {
            let mut st = self.inner.lock();
            let entry = st.entry_mut(id)?;
            match entry.transfer.status {
                TransferStatus::Cancelled => return Ok(()),
                TransferStatus::Completed => {
                    return Err(QueueError::InvalidState {
                        id,
                        status: TransferStatus::Completed,
                    });
                }
                _ => {}
            }
            if let Some(cancel) = entry.cancel.take() {
                cancel.cancel();
            }
            let t = &mut entry.transfer;
            t.status = TransferStatus::Cancelled;
            t.confirmed_bytes = 0;
            t.chunks = None;
            t.bytes_per_second = 0.0;
            t.eta = None;
            let session = t.session.take();
            (vec![status_event(t), progress_event(t)], session)
        };
        info!(transfer = %id, "transfer cancelled");
        if let Some(session) = session {
            self.forget_session(session);
        }
        self.inner.emit(events);
        Ok(())
    }

    /// Re-queues a failed or cancelled transfer.
    pub fn retry(&self, id: TransferId) -> Result<(), QueueError> {
        let event = {
            let mut st = self.inner.lock();
            let entry = st.entry_mut(id)?;
            match entry.transfer.status {
                TransferStatus::Failed | TransferStatus::Cancelled => {
                    if entry.source.is_none() {
                        return Err(QueueError::NoByteSource(id));
                    }
                    entry.transfer.status = TransferStatus::Queued;
                    entry.transfer.error = None;
                    let event = status_event(&entry.transfer);
                    st.pending.push_back(id);
                    event
                }
                status => return Err(QueueError::InvalidState { id, status }),
            }
        };
        info!(transfer = %id, "transfer retried");
        self.inner.emit(vec![event]);
        self.inner.pump();
        Ok(())
    }

    /// Drops a transfer from the queue, cancelling its server session
    /// (best effort) unless it completed.
    pub fn remove(&self, id: TransferId) -> Result<(), QueueError> {
        let entry = self
            .inner
            .lock()
            .transfers
            .remove(&id)
            .ok_or(QueueError::UnknownTransfer(id))?;
        if let Some(cancel) = &entry.cancel {
            cancel.cancel();
        }
        if entry.transfer.status != TransferStatus::Completed {
            if let Some(session) = entry.transfer.session {
                self.forget_session(session);
            }
        }
        debug!(transfer = %id, "transfer removed");
        self.inner.emit(vec![QueueEvent::Removed { id }]);
        Ok(())
    }

    /// Removes every completed transfer. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let removed: Vec<TransferId> = {
            let mut st = self.inner.lock();
            let ids: Vec<_> = st
                .transfers
                .iter()
                .filter(|(_, e)| e.transfer.status == TransferStatus::Completed)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                st.transfers.remove(id);
            }
            ids
        };
        let count = removed.len();
        self.inner
            .emit(removed.into_iter().map(|id| QueueEvent::Removed { id }).collect());
        count
    }

    /// All transfers in submission order.
    pub fn snapshot(&self) -> Vec<Transfer> {
        self.inner
            .lock()
            .transfers
            .values()
            .map(|e| e.transfer.clone())
            .collect()
    }

    pub fn get(&self, id: TransferId) -> Option<Transfer> {
        self.inner
            .lock()
            .transfers
            .get(&id)
            .map(|e| e.transfer.clone())
    }

    /// `true` when no transfer is queued or active.
    pub fn is_idle(&self) -> bool {
        !self
            .inner
            .lock()
            .transfers
            .values()
            .any(|e| e.transfer.status.is_pending())
    }

    /// Waits until no transfer is queued or active.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            if self.is_idle() {
                return;
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Adds a paused placeholder for a session the server remembers.
    ///
    /// Returns `None` if a transfer already tracks that session.
    pub(crate) fn restore_placeholder(&self, summary: &SessionSummary) -> Option<TransferId> {
        let id = {
            let mut st = self.inner.lock();
            let tracked = st.transfers.values().any(|e| {
                e.transfer
                    .session
                    .as_ref()
                    .is_some_and(|s| s.id == summary.session_id)
            });
            if tracked {
                return None;
            }

            st.next_id += 1;
            let id = TransferId(st.next_id);
            let transfer = Transfer {
                id,
                name: summary.filename.clone(),
                size: summary.total_size,
                destination: summary.destination.clone(),
                status: TransferStatus::Paused,
                mode: TransferMode::Chunked,
                confirmed_bytes: summary.confirmed_bytes.min(summary.total_size),
                bytes_per_second: 0.0,
                eta: None,
                session: Some(SessionRef {
                    id: summary.session_id.clone(),
                    chunk_size: summary.chunk_size,
                    total_chunks: summary.total_chunks,
                }),
                chunks: None,
                error: None,
                retries: 0,
                remote_path: None,
                has_source: false,
            };
            st.transfers.insert(
                id,
                Entry {
                    transfer,
                    source: None,
                    cancel: None,
                    generation: 0,
                },
            );
            id
        };
        info!(
            transfer = %id,
            session = %summary.session_id,
            name = %summary.filename,
            "restored placeholder for server session"
        );
        self.inner.emit(vec![QueueEvent::Added { id }]);
        Some(id)
    }

    fn forget_session(&self, session: SessionRef) {
        let api = Arc::clone(&self.inner.api);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            match api.delete_session(&session.id, &cancel).await {
                Ok(()) => debug!(session = %session.id, "remote session deleted"),
                Err(e) => warn!(session = %session.id, error = %e, "failed to delete remote session"),
            }
        });
    }
}

impl QueueState {
    fn entry_mut(&mut self, id: TransferId) -> Result<&mut Entry, QueueError> {
        self.transfers
            .get_mut(&id)
            .ok_or(QueueError::UnknownTransfer(id))
    }

    /// First paused placeholder (no source, dangling session) with this
    /// leaf name and size.
    fn find_placeholder(&self, name: &str, size: u64) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|e| {
                e.source.is_none()
                    && e.transfer.status == TransferStatus::Paused
                    && e.transfer.session.is_some()
                    && e.transfer.name == name
                    && e.transfer.size == size
            })
            .map(|e| e.transfer.id)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, events: Vec<QueueEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Starts workers for queued transfers while slots are free.
    pub(crate) fn pump(self: &Arc<Self>) {
        let limit = self.config.concurrency.max(1);
        let mut jobs = Vec::new();
        let mut events = Vec::new();
        {
            let mut st = self.lock();
            while st.running < limit {
                let Some(id) = st.pending.pop_front() else {
                    break;
                };
                let Some(entry) = st.transfers.get_mut(&id) else {
                    continue;
                };
                if entry.transfer.status != TransferStatus::Queued {
                    continue;
                }
                let Some(source) = entry.source.clone() else {
                    continue;
                };

                let cancel = CancellationToken::new();
                entry.generation += 1;
                entry.cancel = Some(cancel.clone());
                let t = &mut entry.transfer;
                t.status = TransferStatus::Active;
                t.error = None;
                t.retries = 0;
                events.push(status_event(t));
                jobs.push(Job {
                    id,
                    generation: entry.generation,
                    name: t.name.clone(),
                    size: t.size,
                    destination: t.destination.clone(),
                    mode: t.mode,
                    source,
                    cancel,
                });
                st.running += 1;
            }
        }

        self.emit(events);
        for job in jobs {
            tokio::spawn(worker::run(Arc::clone(self), job));
        }
    }

    /// Applies `f` to the transfer if `job` is still its live worker.
    pub(crate) fn update(
        &self,
        job: &Job,
        f: impl FnOnce(&mut Transfer) -> Option<QueueEvent>,
    ) -> bool {
        let event = {
            let mut st = self.lock();
            let Some(entry) = st.transfers.get_mut(&job.id) else {
                return false;
            };
            if entry.generation != job.generation
                || entry.transfer.status != TransferStatus::Active
            {
                return false;
            }
            f(&mut entry.transfer)
        };
        if let Some(event) = event {
            self.emit(vec![event]);
        }
        true
    }

    /// Session the transfer is currently bound to.
    pub(crate) fn session_of(&self, job: &Job) -> Option<SessionRef> {
        self.lock()
            .transfers
            .get(&job.id)
            .and_then(|e| e.transfer.session.clone())
    }

    /// Attaches a freshly created session to the transfer. A pause that
    /// raced the creation still keeps the session; a cancel or removal
    /// does not, and the caller must delete it.
    pub(crate) fn bind_session(&self, job: &Job, session: SessionRef) -> bool {
        let mut st = self.lock();
        let Some(entry) = st.transfers.get_mut(&job.id) else {
            return false;
        };
        if entry.generation != job.generation {
            return false;
        }
        match entry.transfer.status {
            TransferStatus::Active | TransferStatus::Paused => {
                entry.transfer.session = Some(session);
                true
            }
            _ => false,
        }
    }

    /// Records a worker's outcome and admits the next transfer.
    pub(crate) fn finish(self: &Arc<Self>, job: &Job, outcome: Outcome) {
        let mut events = Vec::new();
        {
            let mut st = self.lock();
            st.running = st.running.saturating_sub(1);
            if let Some(entry) = st.transfers.get_mut(&job.id) {
                let live = entry.generation == job.generation
                    && entry.transfer.status == TransferStatus::Active;
                if live {
                    entry.cancel = None;
                    let t = &mut entry.transfer;
                    t.bytes_per_second = 0.0;
                    t.eta = None;
                    match outcome {
                        Outcome::Completed { remote_path } => {
                            t.status = TransferStatus::Completed;
                            t.confirmed_bytes = t.size;
                            t.session = None;
                            t.error = None;
                            t.remote_path = Some(remote_path);
                            events.push(progress_event(t));
                            info!(transfer = %t.id, name = %t.name, size = t.size, "transfer completed");
                        }
                        Outcome::Failed(e) => {
                            t.status = TransferStatus::Failed;
                            t.error = Some(e.to_string());
                            warn!(transfer = %t.id, name = %t.name, error = %e, "transfer failed");
                        }
                        Outcome::Interrupted => {
                            t.status = TransferStatus::Paused;
                        }
                    }
                    events.push(status_event(t));
                }
            }
        }
        self.emit(events);
        self.pump();
    }
}

pub(crate) fn status_event(t: &Transfer) -> QueueEvent {
    QueueEvent::StatusChanged {
        id: t.id,
        status: t.status,
        error: t.error.clone(),
    }
}

pub(crate) fn progress_event(t: &Transfer) -> QueueEvent {
    QueueEvent::Progress {
        id: t.id,
        confirmed_bytes: t.confirmed_bytes,
        size: t.size,
        bytes_per_second: t.bytes_per_second,
        eta: t.eta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::source::MemorySource;
    use crate::testing::{MockApi, eventually, wait_for};
    use ferry_protocol::constants::MAX_BINARY_PAYLOAD;
    use std::time::Duration;

    fn chunked_config() -> QueueConfig {
        QueueConfig {
            chunked_threshold: 1,
            chunk_size: 10,
            retry_backoff_ms: 1,
            ..QueueConfig::default()
        }
    }

    fn file(path: &str, data: &[u8]) -> UploadFile {
        UploadFile::new(path, Arc::new(MemorySource::new(data.to_vec())))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn dest() -> Destination {
        Destination::new("media", "")
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let api = Arc::new(MockApi::with(usize::MAX >> 4, Duration::from_millis(20)));
        let queue = UploadQueue::new(api.clone(), QueueConfig::default());

        let files = (0..10)
            .map(|i| file(&format!("f{i}.txt"), b"small file"))
            .collect();
        let ids = queue.add_files(files, &dest()).unwrap();
        assert_eq!(ids.len(), 10);

        queue.wait_idle().await;
        assert_eq!(api.max_active.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(api.lock().stored.len(), 10);
        assert!(
            queue
                .snapshot()
                .iter()
                .all(|t| t.status == TransferStatus::Completed && t.confirmed_bytes == t.size)
        );
    }

    #[tokio::test]
    async fn small_files_use_single_shot() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api.clone(), QueueConfig::default());

        let ids = queue
            .add_files(vec![file("notes.txt", b"hello")], &dest())
            .unwrap();
        queue.wait_idle().await;

        let t = queue.get(ids[0]).unwrap();
        assert_eq!(t.mode, TransferMode::SingleShot);
        assert_eq!(t.status, TransferStatus::Completed);
        assert_eq!(t.remote_path.as_deref(), Some("media://notes.txt"));
        let st = api.lock();
        assert_eq!(st.create_calls, 0);
        assert_eq!(st.stored[0].2, b"hello");
    }

    #[tokio::test]
    async fn single_shot_reports_rate_and_eta() {
        let api = Arc::new(MockApi::with(usize::MAX >> 4, Duration::from_millis(30)));
        let config = QueueConfig {
            progress_interval_ms: 10,
            ..QueueConfig::default()
        };
        let queue = UploadQueue::new(api.clone(), config);
        let mut rx = queue.subscribe();

        let id = queue
            .add_files(vec![file("clip.mov", &pattern(4000))], &dest())
            .unwrap()[0];
        let event = wait_for(&mut rx, |e| {
            matches!(e, QueueEvent::Progress { confirmed_bytes, bytes_per_second, .. }
                if *confirmed_bytes > 0 && *confirmed_bytes < 4000 && *bytes_per_second > 0.0)
        })
        .await;
        let QueueEvent::Progress { eta, .. } = event else {
            panic!("expected progress, got {event:?}");
        };
        assert!(eta.is_some_and(|d| d > Duration::ZERO));

        queue.wait_idle().await;
        let t = queue.get(id).unwrap();
        assert_eq!(t.mode, TransferMode::SingleShot);
        assert_eq!(t.status, TransferStatus::Completed);
        assert_eq!(t.confirmed_bytes, 4000);
    }

    #[tokio::test]
    async fn frame_sizes_are_clamped_to_message_limit() {
        let api = Arc::new(MockApi::new());
        let config = QueueConfig {
            chunked_threshold: u64::MAX,
            chunk_size: u64::MAX,
            ..QueueConfig::default()
        };
        let queue = UploadQueue::new(api, config);
        assert_eq!(queue.config().chunked_threshold, MAX_BINARY_PAYLOAD);
        assert_eq!(queue.config().chunk_size, MAX_BINARY_PAYLOAD);
    }

    #[tokio::test]
    async fn empty_file_is_single_shot() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api.clone(), chunked_config());

        let ids = queue.add_files(vec![file("empty", b"")], &dest()).unwrap();
        queue.wait_idle().await;

        let t = queue.get(ids[0]).unwrap();
        assert_eq!(t.mode, TransferMode::SingleShot);
        assert_eq!(t.status, TransferStatus::Completed);
        assert_eq!(t.percent(), 100.0);
    }

    #[tokio::test]
    async fn chunked_upload_resumes_after_network_drop() {
        let api = Arc::new(MockApi::new());
        api.lock().fail_chunks.insert(3);
        let queue = UploadQueue::new(api.clone(), chunked_config());
        let data = pattern(60);

        let ids = queue
            .add_files(vec![file("movie.mkv", &data)], &dest())
            .unwrap();
        queue.wait_idle().await;

        let t = queue.get(ids[0]).unwrap();
        assert_eq!(t.status, TransferStatus::Completed, "error: {:?}", t.error);
        assert_eq!(t.retries, 1);
        assert_eq!(t.confirmed_bytes, 60);
        assert!(t.session.is_none());

        let st = api.lock();
        assert_eq!(st.create_calls, 1);
        assert_eq!(st.sent, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(st.missing_calls, vec![vec![3, 4, 5]]);
        assert_eq!(st.stored[0].2, data);
    }

    #[tokio::test]
    async fn last_chunk_may_be_short() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api.clone(), chunked_config());
        let data = pattern(25);

        queue
            .add_files(vec![file("odd.bin", &data)], &dest())
            .unwrap();
        queue.wait_idle().await;

        let st = api.lock();
        assert_eq!(st.sent, vec![0, 1, 2]);
        assert_eq!(st.stored[0].2, data);
    }

    #[tokio::test]
    async fn pause_and_resume_keep_the_session() {
        let api = Arc::new(MockApi::with(2, Duration::ZERO));
        let queue = UploadQueue::new(api.clone(), chunked_config());
        let mut rx = queue.subscribe();
        let data = pattern(40);

        let id = queue
            .add_files(vec![file("a.bin", &data)], &dest())
            .unwrap()[0];
        wait_for(&mut rx, |e| {
            matches!(e, QueueEvent::Progress { confirmed_bytes: 20, .. })
        })
        .await;

        queue.pause(id).unwrap();
        queue.wait_idle().await;
        let t = queue.get(id).unwrap();
        assert_eq!(t.status, TransferStatus::Paused);
        assert_eq!(t.confirmed_bytes, 20);
        assert!(t.session.is_some());
        // Pausing twice is harmless.
        queue.pause(id).unwrap();

        api.permits.add_permits(10);
        queue.resume(id).unwrap();
        queue.wait_idle().await;

        let t = queue.get(id).unwrap();
        assert_eq!(t.status, TransferStatus::Completed);
        let st = api.lock();
        assert_eq!(st.create_calls, 1);
        assert_eq!(st.sent, vec![0, 1, 2, 3]);
        assert_eq!(st.stored[0].2, data);
    }

    #[tokio::test]
    async fn cancel_deletes_remote_session() {
        let api = Arc::new(MockApi::with(1, Duration::ZERO));
        let queue = UploadQueue::new(api.clone(), chunked_config());
        let mut rx = queue.subscribe();

        let id = queue
            .add_files(vec![file("a.bin", &pattern(30))], &dest())
            .unwrap()[0];
        wait_for(&mut rx, |e| {
            matches!(e, QueueEvent::Progress { confirmed_bytes: 10, .. })
        })
        .await;

        queue.cancel(id).unwrap();
        let t = queue.get(id).unwrap();
        assert_eq!(t.status, TransferStatus::Cancelled);
        assert_eq!(t.confirmed_bytes, 0);
        assert!(t.session.is_none());

        eventually(|| api.lock().deleted == vec!["s1".to_string()]).await;
        assert!(api.lock().sessions.is_empty());
    }

    #[tokio::test]
    async fn policy_violation_fails_without_retry() {
        let api = Arc::new(MockApi::new());
        api.lock().reject_create = Some(ApiError::PolicyViolation(".exe not allowed".into()));
        let queue = UploadQueue::new(api.clone(), chunked_config());

        let id = queue
            .add_files(vec![file("setup.exe", &pattern(30))], &dest())
            .unwrap()[0];
        queue.wait_idle().await;

        let t = queue.get(id).unwrap();
        assert_eq!(t.status, TransferStatus::Failed);
        assert!(t.error.unwrap().contains("not allowed"));
        assert_eq!(api.lock().create_calls, 1);
    }

    #[tokio::test]
    async fn retry_after_failure_completes() {
        let api = Arc::new(MockApi::new());
        api.lock().reject_create = Some(ApiError::Forbidden("no".into()));
        let queue = UploadQueue::new(api.clone(), chunked_config());

        let id = queue
            .add_files(vec![file("a.bin", &pattern(30))], &dest())
            .unwrap()[0];
        queue.wait_idle().await;
        assert_eq!(queue.get(id).unwrap().status, TransferStatus::Failed);

        api.lock().reject_create = None;
        queue.retry(id).unwrap();
        queue.wait_idle().await;

        let t = queue.get(id).unwrap();
        assert_eq!(t.status, TransferStatus::Completed);
        assert!(t.error.is_none());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let api = Arc::new(MockApi::new());
        api.lock().fail_chunks.extend([0]);
        let queue = UploadQueue::new(
            api.clone(),
            QueueConfig {
                max_retries: 0,
                ..chunked_config()
            },
        );

        let id = queue
            .add_files(vec![file("a.bin", &pattern(30))], &dest())
            .unwrap()[0];
        queue.wait_idle().await;

        let t = queue.get(id).unwrap();
        assert_eq!(t.status, TransferStatus::Failed);
        assert!(t.error.unwrap().contains("network"));
        // The session survives for a later retry.
        assert!(t.session.is_some());
    }

    #[tokio::test]
    async fn unknown_session_starts_fresh() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api.clone(), chunked_config());
        let data = pattern(30);

        let placeholder = queue
            .restore_placeholder(&SessionSummary {
                session_id: "gone".into(),
                owner: "alice".into(),
                filename: "a.bin".into(),
                destination: dest(),
                total_size: 30,
                chunk_size: 10,
                total_chunks: 3,
                confirmed_chunks: 2,
                confirmed_bytes: 20,
                created_at: String::new(),
                last_activity: String::new(),
            })
            .unwrap();
        assert_eq!(
            queue.resume(placeholder).unwrap_err().to_string(),
            QueueError::NoByteSource(placeholder).to_string()
        );

        let ids = queue
            .add_files(vec![file("a.bin", &data)], &dest())
            .unwrap();
        assert_eq!(ids, vec![placeholder]);
        queue.wait_idle().await;

        let t = queue.get(placeholder).unwrap();
        assert_eq!(t.status, TransferStatus::Completed);
        assert!(t.has_source);
        let st = api.lock();
        assert_eq!(st.create_calls, 1);
        assert_eq!(st.sent, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn folder_paths_extend_destination() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api.clone(), QueueConfig::default());

        let ids = queue
            .add_files(
                vec![file("trip/day1/a.jpg", b"jpg")],
                &Destination::new("media", "photos"),
            )
            .unwrap();
        let t = queue.get(ids[0]).unwrap();
        assert_eq!(t.name, "a.jpg");
        assert_eq!(t.destination, Destination::new("media", "photos/trip/day1"));
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn invalid_path_rejects_whole_batch() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api, QueueConfig::default());

        let err = queue
            .add_files(vec![file("ok.txt", b"x"), file("../etc/passwd", b"x")], &dest())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPath(_)));
        assert!(queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn remove_and_clear_completed() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api, QueueConfig::default());
        let mut rx = queue.subscribe();

        let ids = queue
            .add_files(vec![file("a", b"1"), file("b", b"2"), file("c", b"3")], &dest())
            .unwrap();
        queue.wait_idle().await;

        queue.remove(ids[0]).unwrap();
        wait_for(&mut rx, |e| matches!(e, QueueEvent::Removed { .. })).await;
        assert!(matches!(
            queue.remove(ids[0]),
            Err(QueueError::UnknownTransfer(_))
        ));
        assert_eq!(queue.clear_completed(), 2);
        assert!(queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn completed_transfer_cannot_be_cancelled() {
        let api = Arc::new(MockApi::new());
        let queue = UploadQueue::new(api, QueueConfig::default());

        let id = queue.add_files(vec![file("a", b"1")], &dest()).unwrap()[0];
        queue.wait_idle().await;

        assert!(matches!(
            queue.cancel(id),
            Err(QueueError::InvalidState {
                status: TransferStatus::Completed,
                ..
            })
        ));
        assert!(matches!(
            queue.retry(id),
            Err(QueueError::InvalidState { .. })
        ));
    }
}
