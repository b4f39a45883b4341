//! Upload session operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use ferry_protocol::messages::CreateSessionResponse;
use ferry_protocol::{Destination, SessionProgress, SessionSummary};
use ferry_transfer::{
    ChunkBitmap, ChunkLayout, ChunkStore, DEFAULT_CHUNK_SIZE, validate_file_name, verify_checksum,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SessionError;
use crate::policy::{Caller, DestinationPolicy, PathResolver};
use crate::registry::{SessionEntry, SessionMeta, SessionRegistry};

/// Default cap on chunks per session. Keeps the bitmap small and a full
/// missing-chunk list well under one WebSocket message.
pub const DEFAULT_MAX_TOTAL_CHUNKS: u32 = 1_000_000;

/// Bounds applied at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Largest chunk count a session may have.
    pub max_total_chunks: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: 256 * 1024,
            max_chunk_size: 32 * 1024 * 1024,
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
        }
    }
}

impl SessionLimits {
    /// Clamps a requested chunk size into `[min, max]`.
    pub fn clamp(&self, requested: Option<u64>) -> u64 {
        let min = self.min_chunk_size.max(1);
        let max = self.max_chunk_size.max(min);
        requested.unwrap_or(self.default_chunk_size).max(min).min(max)
    }
}

/// A file written into its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Create, fill, inspect and finalize upload sessions.
pub struct UploadSessionService {
    registry: Arc<SessionRegistry>,
    store: ChunkStore,
    policy: Arc<dyn DestinationPolicy>,
    resolver: Arc<dyn PathResolver>,
    limits: SessionLimits,
}

impl UploadSessionService {
    /// Opens the service over `store`, recovering sessions a previous
    /// process left on disk.
    pub async fn open(
        store: ChunkStore,
        policy: Arc<dyn DestinationPolicy>,
        resolver: Arc<dyn PathResolver>,
        limits: SessionLimits,
    ) -> Result<Self, SessionError> {
        let service = Self {
            registry: Arc::new(SessionRegistry::new()),
            store,
            policy,
            resolver,
            limits,
        };
        service.recover().await?;
        Ok(service)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Opens a new session for `filename` of `total_size` bytes.
    ///
    /// Policy and destination are checked before any storage is touched.
    pub async fn create_session(
        &self,
        caller: &Caller,
        filename: &str,
        total_size: u64,
        destination: &Destination,
        chunk_size: Option<u64>,
    ) -> Result<CreateSessionResponse, SessionError> {
        if total_size == 0 {
            return Err(SessionError::InvalidRequest(
                "total size must be greater than zero".into(),
            ));
        }
        validate_file_name(filename)?;
        self.policy
            .validate_upload(filename, total_size, destination)
            .map_err(SessionError::PolicyViolation)?;
        self.resolver.resolve(destination)?;

        let chunk_size = self.limits.clamp(chunk_size);
        let layout = ChunkLayout::new(total_size, chunk_size)?;
        if layout.total_chunks() > self.limits.max_total_chunks {
            return Err(SessionError::InvalidRequest(format!(
                "{total_size} bytes in {chunk_size}-byte chunks is {} chunks, limit is {}",
                layout.total_chunks(),
                self.limits.max_total_chunks
            )));
        }

        let meta = SessionMeta {
            id: Uuid::new_v4().to_string(),
            owner: caller.id.clone(),
            filename: filename.to_string(),
            destination: destination.clone(),
            total_size,
            chunk_size,
            created_at: Utc::now(),
        };
        self.store
            .write_manifest(&meta.id, &serde_json::to_vec(&meta)?)
            .await?;

        let total_chunks = layout.total_chunks();
        let entry = self.registry.insert(SessionEntry::new(
            meta,
            layout,
            ChunkBitmap::new(total_chunks),
        ));

        info!(
            session = %entry.meta.id,
            owner = %caller.id,
            filename,
            total_size,
            chunk_size,
            total_chunks,
            destination = %destination,
            "session created"
        );

        Ok(CreateSessionResponse {
            session_id: entry.meta.id.clone(),
            chunk_size,
            total_chunks,
        })
    }

    /// Stores chunk `index` and marks it confirmed.
    ///
    /// Re-sending an already confirmed index overwrites it and leaves the
    /// progress unchanged.
    pub async fn accept_chunk(
        &self,
        caller: &Caller,
        session_id: &str,
        index: u32,
        data: &[u8],
        checksum: &str,
    ) -> Result<SessionProgress, SessionError> {
        let entry = self.entry_for(caller, session_id)?;

        let total = entry.layout.total_chunks();
        let expected = entry
            .layout
            .chunk_len(index)
            .ok_or(SessionError::OutOfRange { index, total })?;
        if data.len() as u64 != expected {
            return Err(SessionError::SizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }
        verify_checksum(data, checksum)?;

        let _gate = entry.gate.read().await;
        if entry.state().closed {
            return Err(SessionError::NotFound);
        }

        self.store.put(session_id, index, data).await?;

        let mut state = entry.state();
        let fresh = state.bitmap.set(index);
        state.last_activity = Utc::now();
        let progress = SessionProgress::new(state.bitmap.count(), state.bitmap.len());
        drop(state);

        debug!(
            session = session_id,
            index,
            fresh,
            confirmed = progress.confirmed_chunks,
            total = progress.total_chunks,
            "chunk accepted"
        );
        Ok(progress)
    }

    /// Indices not yet confirmed, ascending. Empty means ready to finalize.
    pub async fn missing_chunks(
        &self,
        caller: &Caller,
        session_id: &str,
    ) -> Result<Vec<u32>, SessionError> {
        let entry = self.entry_for(caller, session_id)?;
        let mut state = entry.state();
        if state.closed {
            return Err(SessionError::NotFound);
        }
        state.last_activity = Utc::now();
        Ok(state.bitmap.missing().collect())
    }

    pub async fn progress(
        &self,
        caller: &Caller,
        session_id: &str,
    ) -> Result<SessionProgress, SessionError> {
        let entry = self.entry_for(caller, session_id)?;
        let mut state = entry.state();
        if state.closed {
            return Err(SessionError::NotFound);
        }
        state.last_activity = Utc::now();
        Ok(SessionProgress::new(
            state.bitmap.count(),
            state.bitmap.len(),
        ))
    }

    /// Assembles every chunk into the destination and closes the session.
    ///
    /// On any failure the partial file is discarded and the session stays
    /// open. A finalized session is gone: finalizing it again is `NotFound`.
    pub async fn finalize(
        &self,
        caller: &Caller,
        session_id: &str,
    ) -> Result<StoredFile, SessionError> {
        let entry = self.entry_for(caller, session_id)?;
        let _gate = entry.gate.write().await;

        {
            let state = entry.state();
            if state.closed {
                return Err(SessionError::NotFound);
            }
            let missing = state.bitmap.len() - state.bitmap.count();
            if missing > 0 {
                return Err(SessionError::Incomplete { missing });
            }
        }

        let meta = &entry.meta;
        let dir = self.resolver.resolve(&meta.destination)?;
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(&meta.filename);
        let tmp = dir.join(format!(".{}.{}.part", meta.filename, meta.id));

        let size = match self.assemble(&entry, &tmp).await {
            Ok(size) => size,
            Err(e) => {
                discard(&tmp).await;
                warn!(session = session_id, error = %e, "finalize failed");
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            discard(&tmp).await;
            return Err(e.into());
        }

        self.close(&entry).await;
        info!(
            session = session_id,
            owner = %meta.owner,
            path = %target.display(),
            size,
            "session finalized"
        );
        Ok(StoredFile { path: target, size })
    }

    /// Removes a session and its chunks regardless of its state.
    ///
    /// Unknown ids succeed silently.
    pub async fn delete_session(&self, caller: &Caller, session_id: &str) -> Result<(), SessionError> {
        let Some(entry) = self.registry.get(session_id) else {
            return Ok(());
        };
        if !caller.can_access(&entry.meta.owner) {
            return Err(SessionError::Forbidden);
        }

        let _gate = entry.gate.write().await;
        if entry.state().closed {
            return Ok(());
        }
        self.close(&entry).await;
        info!(session = session_id, by = %caller.id, "session deleted");
        Ok(())
    }

    /// Sessions visible to `caller`, oldest first.
    pub fn list_sessions(&self, caller: &Caller) -> Vec<SessionSummary> {
        let mut entries: Vec<_> = self
            .registry
            .entries()
            .into_iter()
            .filter(|e| caller.can_access(&e.meta.owner) && !e.state().closed)
            .collect();
        entries.sort_by_key(|e| e.meta.created_at);
        entries.iter().map(|e| e.summary()).collect()
    }

    /// Writes a whole file into its destination without a session.
    pub async fn store_file(
        &self,
        caller: &Caller,
        filename: &str,
        destination: &Destination,
        data: &[u8],
    ) -> Result<StoredFile, SessionError> {
        validate_file_name(filename)?;
        let size = data.len() as u64;
        self.policy
            .validate_upload(filename, size, destination)
            .map_err(SessionError::PolicyViolation)?;
        let dir = self.resolver.resolve(destination)?;
        tokio::fs::create_dir_all(&dir).await?;

        let target = dir.join(filename);
        let tmp = dir.join(format!(".{filename}.{}.part", Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await
        }
        .await;
        if let Err(e) = written {
            discard(&tmp).await;
            return Err(e.into());
        }

        info!(owner = %caller.id, path = %target.display(), size, "file stored");
        Ok(StoredFile { path: target, size })
    }

    /// Deletes sessions idle for at least `idle_timeout`. Returns how many
    /// were removed.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let timeout = TimeDelta::from_std(idle_timeout).unwrap_or(TimeDelta::MAX);
        let is_idle = |entry: &Arc<SessionEntry>| {
            let state = entry.state();
            !state.closed && Utc::now() - state.last_activity >= timeout
        };

        let mut swept = 0;
        for entry in self.registry.entries() {
            if !is_idle(&entry) {
                continue;
            }
            let _gate = entry.gate.write().await;
            // Activity may have happened while waiting for the gate.
            if !is_idle(&entry) {
                continue;
            }
            self.close(&entry).await;
            info!(session = %entry.meta.id, owner = %entry.meta.owner, "idle session swept");
            swept += 1;
        }
        swept
    }

    fn entry_for(&self, caller: &Caller, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        let entry = self.registry.get(session_id).ok_or(SessionError::NotFound)?;
        if !caller.can_access(&entry.meta.owner) {
            return Err(SessionError::Forbidden);
        }
        Ok(entry)
    }

    /// Writes chunks `0..n` into `tmp` and re-checks size and policy.
    async fn assemble(&self, entry: &SessionEntry, tmp: &Path) -> Result<u64, SessionError> {
        let meta = &entry.meta;
        let mut file = tokio::fs::File::create(tmp).await?;
        let size = self
            .store
            .append_to(&meta.id, entry.layout.total_chunks(), &mut file)
            .await?;
        file.sync_all().await?;
        drop(file);

        if size != meta.total_size {
            return Err(SessionError::SizeMismatch {
                expected: meta.total_size,
                actual: size,
            });
        }
        self.policy
            .validate_upload(&meta.filename, size, &meta.destination)
            .map_err(SessionError::PolicyViolation)?;
        Ok(size)
    }

    /// Marks the entry closed, drops it from the registry and deletes its
    /// scratch. Caller must hold the gate exclusively.
    async fn close(&self, entry: &SessionEntry) {
        entry.state().closed = true;
        self.registry.remove(&entry.meta.id);
        if let Err(e) = self.store.remove_session(&entry.meta.id).await {
            warn!(session = %entry.meta.id, error = %e, "failed to remove scratch");
        }
    }

    async fn recover(&self) -> Result<(), SessionError> {
        for stored in self.store.load_all().await? {
            let meta: SessionMeta = match serde_json::from_slice(&stored.manifest) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(session = %stored.id, error = %e, "unreadable manifest, discarding session");
                    self.store.remove_session(&stored.id).await?;
                    continue;
                }
            };
            let layout = match ChunkLayout::new(meta.total_size, meta.chunk_size) {
                Ok(layout) if meta.id == stored.id => layout,
                _ => {
                    warn!(session = %stored.id, "inconsistent manifest, discarding session");
                    self.store.remove_session(&stored.id).await?;
                    continue;
                }
            };

            let mut bitmap = ChunkBitmap::new(layout.total_chunks());
            for (index, len) in stored.chunks {
                if layout.chunk_len(index) == Some(len) {
                    bitmap.set(index);
                } else {
                    debug!(session = %stored.id, index, len, "ignoring malformed chunk");
                }
            }

            info!(
                session = %meta.id,
                owner = %meta.owner,
                confirmed = bitmap.count(),
                total = bitmap.len(),
                "session recovered"
            );
            self.registry.insert(SessionEntry::new(meta, layout, bitmap));
        }
        Ok(())
    }
}

async fn discard(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}
