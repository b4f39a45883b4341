//! Rebuilds the queue from sessions the server still holds.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ApiError;
use crate::queue::UploadQueue;
use crate::types::TransferId;

/// Adds a paused placeholder for each open server session.
///
/// A session is restored at most once per coordinator, even if the
/// user removes its placeholder afterwards. Adding a file with the
/// same leaf name and size binds it to the placeholder and resumes the
/// session from the server's missing list.
pub struct RestoreCoordinator {
    queue: UploadQueue,
    seen: Mutex<HashSet<String>>,
}

impl RestoreCoordinator {
    pub fn new(queue: UploadQueue) -> Self {
        Self {
            queue,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Lists server sessions and returns the placeholders created.
    pub async fn restore(&self, cancel: &CancellationToken) -> Result<Vec<TransferId>, ApiError> {
        let sessions = self.queue.api().list_sessions(cancel).await?;

        let mut restored = Vec::new();
        for summary in &sessions {
            let fresh = self
                .seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(summary.session_id.clone());
            if !fresh {
                continue;
            }
            if let Some(id) = self.queue.restore_placeholder(summary) {
                restored.push(id);
            }
        }

        info!(
            listed = sessions.len(),
            restored = restored.len(),
            "restored server sessions"
        );
        Ok(restored)
    }
}
