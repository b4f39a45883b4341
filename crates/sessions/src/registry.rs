//! In-memory table of open upload sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use ferry_protocol::{Destination, SessionProgress, SessionSummary};
use ferry_transfer::{ChunkBitmap, ChunkLayout};
use serde::{Deserialize, Serialize};

/// Immutable description of a session, persisted as its manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub owner: String,
    pub filename: String,
    pub destination: Destination,
    pub total_size: u64,
    pub chunk_size: u64,
    pub created_at: DateTime<Utc>,
}

/// Mutable part of a session, guarded by a short mutex.
#[derive(Debug)]
pub struct SessionState {
    pub bitmap: ChunkBitmap,
    pub last_activity: DateTime<Utc>,
    /// Set once the session is finalized, deleted or swept.
    pub closed: bool,
}

/// One open session.
///
/// `gate` is held shared while a chunk is written and exclusively while
/// the session is assembled or removed.
#[derive(Debug)]
pub struct SessionEntry {
    pub meta: SessionMeta,
    pub layout: ChunkLayout,
    pub gate: tokio::sync::RwLock<()>,
    state: Mutex<SessionState>,
}

impl SessionEntry {
    pub fn new(meta: SessionMeta, layout: ChunkLayout, bitmap: ChunkBitmap) -> Self {
        Self {
            meta,
            layout,
            gate: tokio::sync::RwLock::new(()),
            state: Mutex::new(SessionState {
                bitmap,
                last_activity: Utc::now(),
                closed: false,
            }),
        }
    }

    /// Locks the mutable state. Never hold the guard across an await.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn progress(&self) -> SessionProgress {
        let state = self.state();
        SessionProgress::new(state.bitmap.count(), state.bitmap.len())
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state();
        SessionSummary {
            session_id: self.meta.id.clone(),
            owner: self.meta.owner.clone(),
            filename: self.meta.filename.clone(),
            destination: self.meta.destination.clone(),
            total_size: self.meta.total_size,
            chunk_size: self.meta.chunk_size,
            total_chunks: self.layout.total_chunks(),
            confirmed_chunks: state.bitmap.count(),
            confirmed_bytes: self.layout.bytes_for(state.bitmap.present()),
            created_at: self.meta.created_at.to_rfc3339(),
            last_activity: state.last_activity.to_rfc3339(),
        }
    }
}

/// Map of session id to entry. The map lock is only held for lookups,
/// inserts and removals.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: SessionEntry) -> Arc<SessionEntry> {
        let entry = Arc::new(entry);
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.meta.id.clone(), Arc::clone(&entry));
        entry
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
