// Messaging endpoint abstraction
//
// The pipeline talks to the outside world only through `Notifier`. Sends
// return a `NotificationHandle` that the issuer must eventually delete or
// supersede; failures come back as `PipelineError::Dispatch` and are never
// fatal to the caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Remote message identifier plus an optional scheduled deletion time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationHandle {
    /// Identifier assigned by the messaging endpoint
    pub message_id: i64,

    /// When a pending scheduled delete will fire, if one was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_at: Option<DateTime<Utc>>,
}

impl NotificationHandle {
    pub fn new(message_id: i64) -> Self {
        Self {
            message_id,
            delete_at: None,
        }
    }

    /// Stamp the time a scheduled delete will fire
    pub fn with_delete_at(mut self, at: DateTime<Utc>) -> Self {
        self.delete_at = Some(at);
        self
    }

    pub fn is_ephemeral(&self) -> bool {
        self.delete_at.is_some()
    }
}

/// Binary payload attached to a final notification
#[derive(Debug, Clone)]
pub struct Attachment {
    /// File name presented to the endpoint
    pub file_name: String,
    /// Raw bytes
    pub bytes: Vec<u8>,
    /// MIME type, if known
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Notifier - Messaging endpoint used by every component
// ============================================================================

/// Trait for the external messaging endpoint
///
/// Implementations can:
/// - Call a chat bot HTTP API
/// - Record messages in memory for testing
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a text message
    async fn send(&self, text: &str) -> Result<NotificationHandle>;

    /// Send a binary attachment with a caption.
    ///
    /// Returns `None` without uploading when the attachment is below the
    /// minimum viable size. When the upload itself fails the caption is sent
    /// as a text-only message instead and `None` is still returned.
    async fn send_with_attachment(
        &self,
        attachment: Attachment,
        caption: &str,
    ) -> Option<NotificationHandle>;

    /// Delete a message. Cancels any pending scheduled delete for it.
    async fn delete(&self, handle: &NotificationHandle) -> Result<()>;

    /// Schedule a delete after `after`, returning the handle stamped with
    /// its deletion time
    fn schedule_delete(&self, handle: NotificationHandle, after: Duration) -> NotificationHandle;

    /// Cancel a pending scheduled delete. Returns whether one was pending.
    fn cancel_scheduled_delete(&self, handle: &NotificationHandle) -> bool;

    /// Send a message that deletes itself after `after`
    async fn send_ephemeral(&self, text: &str, after: Duration) -> Result<NotificationHandle> {
        let handle = self.send(text).await?;
        Ok(self.schedule_delete(handle, after))
    }

    /// Delete `previous` (if any) and send `text` in its place
    async fn supersede(
        &self,
        previous: Option<&NotificationHandle>,
        text: &str,
    ) -> Result<NotificationHandle> {
        if let Some(previous) = previous {
            if let Err(e) = self.delete(previous).await {
                tracing::debug!(
                    message_id = previous.message_id,
                    "Delete before supersede failed: {}",
                    e
                );
            }
        }
        self.send(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ephemeral() {
        let handle = NotificationHandle::new(42);
        assert!(!handle.is_ephemeral());

        let handle = handle.with_delete_at(Utc::now());
        assert!(handle.is_ephemeral());
        assert_eq!(handle.message_id, 42);
    }

    #[test]
    fn test_attachment_builder() {
        let attachment = Attachment::new("call.mp3", vec![0u8; 16]).with_content_type("audio/mpeg");
        assert_eq!(attachment.len(), 16);
        assert!(!attachment.is_empty());
        assert_eq!(attachment.content_type.as_deref(), Some("audio/mpeg"));
    }
}
