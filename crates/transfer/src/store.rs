//! On-disk scratch space for received chunks.
//!
//! Layout: `<root>/<session>/<index>.chunk` plus a `session.json` manifest
//! owned by the caller. Every file is written to a temp name and renamed
//! into place, so a crash never leaves a half-written chunk visible.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::TransferError;
use crate::validation::validate_file_name;

const MANIFEST_FILE: &str = "session.json";
const CHUNK_EXT: &str = "chunk";
const TMP_EXT: &str = "tmp";

/// A session directory found on disk by [`ChunkStore::load_all`].
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub id: String,
    pub manifest: Vec<u8>,
    /// `(index, byte length)` of every chunk present.
    pub chunks: Vec<(u32, u64)>,
}

/// Durable chunk storage keyed by `(session, index)`.
pub struct ChunkStore {
    root: PathBuf,
    nonce: AtomicU64,
}

impl ChunkStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            nonce: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes chunk `index` of `session`, replacing any previous copy.
    pub async fn put(&self, session: &str, index: u32, data: &[u8]) -> Result<(), TransferError> {
        let dir = self.session_dir(session)?;
        tokio::fs::create_dir_all(&dir).await?;
        let target = chunk_path(&dir, index);
        self.write_atomic(&dir, &target, data).await?;
        debug!(session, index, bytes = data.len(), "chunk stored");
        Ok(())
    }

    /// Reads chunk `index` of `session` into memory.
    pub async fn read(&self, session: &str, index: u32) -> Result<Vec<u8>, TransferError> {
        let path = chunk_path(&self.session_dir(session)?, index);
        tokio::fs::read(&path).await.map_err(|e| missing_or_io(e, index))
    }

    /// Streams chunks `0..count` of `session`, in index order, into `out`.
    ///
    /// Returns the number of bytes appended. Fails with
    /// [`TransferError::MissingChunk`] if any chunk file is absent.
    pub async fn append_to<W>(
        &self,
        session: &str,
        count: u32,
        out: &mut W,
    ) -> Result<u64, TransferError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let dir = self.session_dir(session)?;
        let mut writer = BufWriter::new(out);
        let mut total = 0u64;
        for index in 0..count {
            let mut chunk = tokio::fs::File::open(chunk_path(&dir, index))
                .await
                .map_err(|e| missing_or_io(e, index))?;
            total += tokio::io::copy(&mut chunk, &mut writer).await?;
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Persists the session manifest next to its chunks.
    pub async fn write_manifest(&self, session: &str, manifest: &[u8]) -> Result<(), TransferError> {
        let dir = self.session_dir(session)?;
        tokio::fs::create_dir_all(&dir).await?;
        self.write_atomic(&dir, &dir.join(MANIFEST_FILE), manifest)
            .await
    }

    /// Removes every file of `session`. Missing sessions are not an error.
    pub async fn remove_session(&self, session: &str) -> Result<(), TransferError> {
        let dir = self.session_dir(session)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session, "scratch removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Scans the store for sessions left by a previous process.
    ///
    /// Directories without a manifest are removed; stray temp files are
    /// deleted.
    pub async fn load_all(&self) -> Result<Vec<StoredSession>, TransferError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let dir = entry.path();

            let manifest = match tokio::fs::read(dir.join(MANIFEST_FILE)).await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(session = %id, "scratch directory without manifest, removing");
                    tokio::fs::remove_dir_all(&dir).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let chunks = scan_chunks(&dir).await?;
            sessions.push(StoredSession {
                id,
                manifest,
                chunks,
            });
        }

        Ok(sessions)
    }

    fn session_dir(&self, session: &str) -> Result<PathBuf, TransferError> {
        validate_file_name(session)?;
        Ok(self.root.join(session))
    }

    async fn write_atomic(&self, dir: &Path, target: &Path, data: &[u8]) -> Result<(), TransferError> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!("{nonce}.{TMP_EXT}"));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, target).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn chunk_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{index:08}.{CHUNK_EXT}"))
}

fn missing_or_io(e: std::io::Error, index: u32) -> TransferError {
    if e.kind() == std::io::ErrorKind::NotFound {
        TransferError::MissingChunk { index }
    } else {
        TransferError::Io(e)
    }
}

async fn scan_chunks(dir: &Path) -> Result<Vec<(u32, u64)>, TransferError> {
    let mut chunks = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some(CHUNK_EXT) => {
                let index = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok());
                if let Some(index) = index {
                    chunks.push((index, entry.metadata().await?.len()));
                }
            }
            Some(TMP_EXT) => {
                let _ = tokio::fs::remove_file(&path).await;
            }
            _ => {}
        }
    }

    chunks.sort_unstable();
    Ok(chunks)
}
