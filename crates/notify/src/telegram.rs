// Telegram Notifier
//
// Implements the Notifier trait from callrelay-core over the Telegram Bot
// API: sendMessage, sendVoice and deleteMessage. Messages use HTML parse mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callrelay_core::format;
use callrelay_core::{
    Attachment, DispatchConfig, NotificationHandle, Notifier, PipelineError, Result,
};
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::scheduler::DeletionScheduler;

const PARSE_MODE: &str = "HTML";
const DEFAULT_AUDIO_TYPE: &str = "audio/mpeg";

/// Bot API errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Transport failure or timeout
    #[error("http error: {0}")]
    Http(reqwest::Error),

    /// The API answered with an error
    #[error("api error ({status}): {description}")]
    Api { status: u16, description: String },

    /// The API answered with something unexpected
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        // Request URLs carry the bot token
        DispatchError::Http(e.without_url())
    }
}

impl From<DispatchError> for PipelineError {
    fn from(e: DispatchError) -> Self {
        PipelineError::Dispatch(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    description: Option<String>,
}

/// Thin client over the three Bot API methods in use
struct BotApi {
    client: Client,
    config: DispatchConfig,
}

impl std::fmt::Debug for BotApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotApi")
            .field("api_base", &self.config.api_base)
            .field("chat_id", &self.config.chat_id)
            .finish_non_exhaustive()
    }
}

impl BotApi {
    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    async fn call(&self, request: RequestBuilder) -> std::result::Result<Value, DispatchError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let parsed: Option<ApiResponse> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let description = parsed.and_then(|p| p.description).unwrap_or(body);
            return Err(DispatchError::Api {
                status: status.as_u16(),
                description,
            });
        }

        let parsed =
            parsed.ok_or_else(|| DispatchError::Protocol(format!("not a bot api response: {}", body)))?;
        if !parsed.ok {
            return Err(DispatchError::Api {
                status: status.as_u16(),
                description: parsed.description.unwrap_or_default(),
            });
        }
        Ok(parsed.result)
    }

    async fn send_message(&self, text: &str) -> std::result::Result<i64, DispatchError> {
        let request = self
            .client
            .post(self.method_url("sendMessage"))
            .timeout(self.config.request_timeout)
            .json(&json!({
                "chat_id": self.config.chat_id,
                "text": text,
                "parse_mode": PARSE_MODE,
            }));
        message_id(&self.call(request).await?)
    }

    async fn send_voice(
        &self,
        attachment: Attachment,
        caption: &str,
    ) -> std::result::Result<i64, DispatchError> {
        let content_type = attachment
            .content_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_AUDIO_TYPE.to_string());
        let voice = Part::bytes(attachment.bytes)
            .file_name(attachment.file_name)
            .mime_str(&content_type)?;
        let form = Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .text("caption", caption.to_string())
            .text("parse_mode", PARSE_MODE)
            .part("voice", voice);

        let request = self
            .client
            .post(self.method_url("sendVoice"))
            .timeout(self.config.upload_timeout)
            .multipart(form);
        message_id(&self.call(request).await?)
    }

    async fn delete_message(&self, message_id: i64) -> std::result::Result<(), DispatchError> {
        let request = self
            .client
            .post(self.method_url("deleteMessage"))
            .timeout(self.config.delete_timeout)
            .json(&json!({
                "chat_id": self.config.chat_id,
                "message_id": message_id,
            }));
        self.call(request).await.map(|_| ())
    }
}

fn message_id(result: &Value) -> std::result::Result<i64, DispatchError> {
    result["message_id"]
        .as_i64()
        .ok_or_else(|| DispatchError::Protocol("result without message_id".to_string()))
}

/// Notifier backed by a Telegram bot
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    api: Arc<BotApi>,
    scheduler: DeletionScheduler,
}

impl TelegramNotifier {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| PipelineError::config(format!("telegram client: {}", e)))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: DispatchConfig) -> Self {
        Self {
            api: Arc::new(BotApi { client, config }),
            scheduler: DeletionScheduler::new(),
        }
    }

    /// Scheduled deletes not yet fired
    pub fn pending_deletes(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Drop every scheduled delete, leaving those messages in place
    pub fn cancel_all_deletes(&self) -> usize {
        self.scheduler.cancel_all()
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip_all)]
    async fn send(&self, text: &str) -> Result<NotificationHandle> {
        let message_id = self.api.send_message(text).await.map_err(|e| {
            warn!(error = %e, "sendMessage failed");
            PipelineError::from(e)
        })?;
        debug!(message_id, "Message sent");
        Ok(NotificationHandle::new(message_id))
    }

    #[instrument(skip_all, fields(file = %attachment.file_name, size = attachment.len()))]
    async fn send_with_attachment(
        &self,
        attachment: Attachment,
        caption: &str,
    ) -> Option<NotificationHandle> {
        let floor = self.api.config.min_attachment_bytes;
        if (attachment.len() as u64) < floor {
            warn!(floor, "Attachment below minimum size, not uploading");
            return None;
        }

        match self.api.send_voice(attachment, caption).await {
            Ok(message_id) => {
                info!(message_id, "Attachment delivered");
                Some(NotificationHandle::new(message_id))
            }
            Err(e) => {
                warn!(error = %e, "sendVoice failed, falling back to text");
                if let Err(e) = self.send(&format::upload_fallback(caption)).await {
                    warn!(error = %e, "Fallback text failed");
                }
                None
            }
        }
    }

    async fn delete(&self, handle: &NotificationHandle) -> Result<()> {
        self.scheduler.cancel(handle.message_id);
        self.api
            .delete_message(handle.message_id)
            .await
            .map_err(|e| {
                debug!(message_id = handle.message_id, error = %e, "deleteMessage failed");
                PipelineError::from(e)
            })
    }

    fn schedule_delete(&self, handle: NotificationHandle, after: Duration) -> NotificationHandle {
        let api = Arc::clone(&self.api);
        let message_id = handle.message_id;
        let scheduled = self.scheduler.schedule(message_id, after, async move {
            if let Err(e) = api.delete_message(message_id).await {
                debug!(message_id, error = %e, "Scheduled delete failed");
            }
        });
        if !scheduled {
            return handle;
        }

        let at = Utc::now() + chrono::Duration::from_std(after).unwrap_or_default();
        handle.with_delete_at(at)
    }

    fn cancel_scheduled_delete(&self, handle: &NotificationHandle) -> bool {
        self.scheduler.cancel(handle.message_id)
    }
}
