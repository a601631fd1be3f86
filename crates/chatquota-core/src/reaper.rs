use chatquota_ipc::{ChatPlatform, MessageHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Deletes transient notices after a delay. Pending deletions are lost on restart.
#[derive(Clone)]
pub struct NoticeReaper {
    platform: Arc<dyn ChatPlatform>,
}

impl NoticeReaper {
    pub fn new(platform: Arc<dyn ChatPlatform>) -> Self {
        Self { platform }
    }

    /// A zero TTL keeps the notice.
    pub fn schedule(&self, handle: MessageHandle, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let platform = Arc::clone(&self.platform);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(e) = platform.delete_message(handle).await {
                debug!(
                    "Notice {} in room {} was not deleted: {}",
                    handle.message_id, handle.room_id, e
                );
            }
        });
    }
}
