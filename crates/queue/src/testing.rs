//! In-memory [`SessionApi`] for queue tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ferry_protocol::messages::{
    CreateSessionRequest, CreateSessionResponse, FileStoredResponse, FinalizeResponse,
};
use ferry_protocol::{Destination, SessionProgress, SessionSummary};
use ferry_transfer::{DEFAULT_CHUNK_SIZE, checksum_bytes};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiFuture, OnSent, SessionApi};
use crate::error::ApiError;
use crate::types::QueueEvent;

pub(crate) struct MockSession {
    pub filename: String,
    pub destination: Destination,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct MockState {
    pub sessions: HashMap<String, MockSession>,
    pub next_session: u32,
    pub create_calls: usize,
    /// Indices accepted by `send_chunk`, in arrival order.
    pub sent: Vec<u32>,
    /// Every answer given by `missing_chunks`.
    pub missing_calls: Vec<Vec<u32>>,
    pub deleted: Vec<String>,
    pub stored: Vec<(String, Destination, Vec<u8>)>,
    /// Chunk indices that fail once with a network error.
    pub fail_chunks: HashSet<u32>,
    /// Error returned by every `create_session` while set.
    pub reject_create: Option<ApiError>,
}

pub(crate) struct MockApi {
    state: Mutex<MockState>,
    /// One permit per chunk the mock lets through.
    pub permits: Semaphore,
    delay: Duration,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::with(Semaphore::MAX_PERMITS, Duration::ZERO)
    }

    pub fn with(permits: usize, delay: Duration) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            permits: Semaphore::new(permits),
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Seeds a session as if an earlier client run had created it.
    pub fn seed_session(
        &self,
        id: &str,
        filename: &str,
        data: &[u8],
        chunk_size: u64,
        received: &[u32],
    ) {
        let total_chunks = (data.len() as u64).div_ceil(chunk_size) as u32;
        let mut chunks = BTreeMap::new();
        for &index in received {
            let start = (index as u64 * chunk_size) as usize;
            let end = (start + chunk_size as usize).min(data.len());
            chunks.insert(index, data[start..end].to_vec());
        }
        self.lock().sessions.insert(
            id.to_string(),
            MockSession {
                filename: filename.to_string(),
                destination: Destination::new("media", ""),
                total_size: data.len() as u64,
                chunk_size,
                total_chunks,
                received: chunks,
            },
        );
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(&self.active)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), ApiError> {
        if self.delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }
}

impl SessionApi for MockApi {
    fn create_session<'a>(
        &'a self,
        req: CreateSessionRequest,
        _cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, CreateSessionResponse> {
        Box::pin(async move {
            let mut st = self.lock();
            st.create_calls += 1;
            if let Some(err) = &st.reject_create {
                return Err(err.clone());
            }
            if req.total_size == 0 {
                return Err(ApiError::InvalidRequest("empty file".into()));
            }
            st.next_session += 1;
            let id = format!("s{}", st.next_session);
            let chunk_size = req.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
            let total_chunks = req.total_size.div_ceil(chunk_size) as u32;
            st.sessions.insert(
                id.clone(),
                MockSession {
                    filename: req.filename,
                    destination: req.destination,
                    total_size: req.total_size,
                    chunk_size,
                    total_chunks,
                    received: BTreeMap::new(),
                },
            );
            Ok(CreateSessionResponse {
                session_id: id,
                chunk_size,
                total_chunks,
            })
        })
    }

    fn send_chunk<'a>(
        &'a self,
        session_id: &'a str,
        index: u32,
        data: Vec<u8>,
        checksum: String,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress> {
        Box::pin(async move {
            let _active = self.enter();
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                permit = self.permits.acquire() => permit,
            };
            permit
                .map_err(|e| ApiError::NetworkInterrupted(e.to_string()))?
                .forget();
            self.pause(cancel).await?;

            let mut st = self.lock();
            if st.fail_chunks.remove(&index) {
                return Err(ApiError::NetworkInterrupted("connection reset".into()));
            }
            let session = st
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| ApiError::NotFound(session_id.to_string()))?;
            if index >= session.total_chunks {
                return Err(ApiError::OutOfRange(format!("chunk {index}")));
            }
            if checksum_bytes(&data) != checksum {
                return Err(ApiError::ChecksumMismatch(format!("chunk {index}")));
            }
            session.received.insert(index, data);
            let progress =
                SessionProgress::new(session.received.len() as u32, session.total_chunks);
            st.sent.push(index);
            Ok(progress)
        })
    }

    fn missing_chunks<'a>(
        &'a self,
        session_id: &'a str,
        _cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<u32>> {
        Box::pin(async move {
            let mut st = self.lock();
            let session = st
                .sessions
                .get(session_id)
                .ok_or_else(|| ApiError::NotFound(session_id.to_string()))?;
            let missing: Vec<u32> = (0..session.total_chunks)
                .filter(|i| !session.received.contains_key(i))
                .collect();
            st.missing_calls.push(missing.clone());
            Ok(missing)
        })
    }

    fn progress<'a>(
        &'a self,
        session_id: &'a str,
        _cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress> {
        Box::pin(async move {
            let st = self.lock();
            let session = st
                .sessions
                .get(session_id)
                .ok_or_else(|| ApiError::NotFound(session_id.to_string()))?;
            Ok(SessionProgress::new(
                session.received.len() as u32,
                session.total_chunks,
            ))
        })
    }

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
        _cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FinalizeResponse> {
        Box::pin(async move {
            let mut st = self.lock();
            let session = st
                .sessions
                .get(session_id)
                .ok_or_else(|| ApiError::NotFound(session_id.to_string()))?;
            if (session.received.len() as u32) < session.total_chunks {
                return Err(ApiError::Incomplete(format!(
                    "{} chunks missing",
                    session.total_chunks - session.received.len() as u32
                )));
            }
            let Some(session) = st.sessions.remove(session_id) else {
                return Err(ApiError::NotFound(session_id.to_string()));
            };
            let data: Vec<u8> = session.received.into_values().flatten().collect();
            let path = format!("{}/{}", session.destination, session.filename);
            let size = data.len() as u64;
            st.stored.push((session.filename, session.destination, data));
            Ok(FinalizeResponse {
                session_id: session_id.to_string(),
                path,
                size,
            })
        })
    }

    fn delete_session<'a>(
        &'a self,
        session_id: &'a str,
        _cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let mut st = self.lock();
            st.sessions.remove(session_id);
            st.deleted.push(session_id.to_string());
            Ok(())
        })
    }

    fn list_sessions<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<SessionSummary>> {
        Box::pin(async move {
            let st = self.lock();
            let mut sessions: Vec<SessionSummary> = st
                .sessions
                .iter()
                .map(|(id, s)| SessionSummary {
                    session_id: id.clone(),
                    owner: "alice".into(),
                    filename: s.filename.clone(),
                    destination: s.destination.clone(),
                    total_size: s.total_size,
                    chunk_size: s.chunk_size,
                    total_chunks: s.total_chunks,
                    confirmed_chunks: s.received.len() as u32,
                    confirmed_bytes: s.received.values().map(|c| c.len() as u64).sum(),
                    created_at: "2026-01-01T00:00:00Z".into(),
                    last_activity: "2026-01-01T00:00:00Z".into(),
                })
                .collect();
            sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            Ok(sessions)
        })
    }

    fn store_file<'a>(
        &'a self,
        filename: &'a str,
        destination: &'a Destination,
        data: Vec<u8>,
        on_sent: &'a OnSent<'a>,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FileStoredResponse> {
        Box::pin(async move {
            let _active = self.enter();
            let size = data.len() as u64;
            // The bytes leave in quarters, one delay each.
            for quarter in 1..=4u64 {
                self.pause(cancel).await?;
                on_sent(size * quarter / 4);
            }
            let path = format!("{destination}/{filename}");
            self.lock()
                .stored
                .push((filename.to_string(), destination.clone(), data));
            Ok(FileStoredResponse { path, size })
        })
    }
}

/// Receives events until `pred` matches one, or panics after 5 seconds.
pub(crate) async fn wait_for(
    rx: &mut broadcast::Receiver<QueueEvent>,
    mut pred: impl FnMut(&QueueEvent) -> bool,
) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for queue event")
}

/// Polls `cond` every 10 ms for up to 5 seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
