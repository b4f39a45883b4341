use serde::{Deserialize, Serialize};

/// Where an upload lands: a storage zone and a path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

impl Destination {
    pub fn new(zone: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            path: path.into(),
        }
    }

    /// Returns a destination with `prefix` appended to the path.
    ///
    /// Used for folder uploads, where each file carries its own
    /// directory prefix relative to the folder root.
    pub fn join(&self, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return self.clone();
        }
        let base = self.path.trim_end_matches('/');
        let path = if base.is_empty() {
            prefix.to_string()
        } else {
            format!("{base}/{prefix}")
        };
        Self {
            zone: self.zone.clone(),
            path,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:/{}", self.zone, self.path.trim_start_matches('/'))
    }
}

/// Chunk-level progress of a session, always derived from its bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub confirmed_chunks: u32,
    pub total_chunks: u32,
    pub percent: f64,
}

impl SessionProgress {
    pub fn new(confirmed_chunks: u32, total_chunks: u32) -> Self {
        let percent = if total_chunks == 0 {
            0.0
        } else {
            confirmed_chunks as f64 / total_chunks as f64 * 100.0
        };
        Self {
            confirmed_chunks,
            total_chunks,
            percent,
        }
    }

    /// Returns `true` when every chunk is confirmed.
    pub fn is_complete(&self) -> bool {
        self.confirmed_chunks == self.total_chunks
    }
}

/// Summary of an open session, as listed for restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub owner: String,
    pub filename: String,
    pub destination: Destination,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub confirmed_chunks: u32,
    /// Bytes covered by confirmed chunks.
    pub confirmed_bytes: u64,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last accepted request.
    pub last_activity: String,
}
