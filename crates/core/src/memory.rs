// In-memory implementations for testing
//
// These stand in for the live browser and the messaging endpoint:
// - ScriptedBrowser serves canned pages, markup and script replies
// - RecordingNotifier records every call in order and honours scheduled deletes

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::browser::BrowserSession;
use crate::error::{PipelineError, Result};
use crate::format;
use crate::notify::{Attachment, NotificationHandle, Notifier};
use crate::session::BrowserCookie;

// ============================================================================
// ScriptedBrowser - Canned browsing session
// ============================================================================

/// A challenge interstitial the scripted browser shows until it is cleared
#[derive(Debug, Clone)]
pub struct ScriptedChallenge {
    pub title: String,
    pub body: String,
    /// Selectors that match while the challenge is showing
    pub markers: Vec<String>,
    /// A script containing this text clears the challenge
    pub clears_on_script: Option<String>,
    /// The challenge clears by itself this long after it is installed
    pub clears_after: Option<Duration>,
}

impl ScriptedChallenge {
    /// A Cloudflare-style interstitial that never clears by itself
    pub fn cloudflare() -> Self {
        Self {
            title: "Just a moment...".to_string(),
            body: "<html><body><div class=\"cf-challenge\">Checking your browser before accessing. \
                   <iframe src=\"https://challenges.cloudflare.com/turnstile\"></iframe></div></body></html>"
                .to_string(),
            markers: vec!["iframe[src*='challenge']".to_string()],
            clears_on_script: None,
            clears_after: None,
        }
    }

    pub fn clears_on_script(mut self, needle: impl Into<String>) -> Self {
        self.clears_on_script = Some(needle.into());
        self
    }

    pub fn clears_after(mut self, after: Duration) -> Self {
        self.clears_after = Some(after);
        self
    }
}

#[derive(Debug)]
struct ActiveChallenge {
    page: ScriptedChallenge,
    clears_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    current_url: String,
    title: String,
    source: String,
    markup: HashMap<String, Vec<String>>,
    replies: Vec<(String, VecDeque<Value>)>,
    cookies: Vec<BrowserCookie>,
    redirects: HashMap<String, String>,
    challenge: Option<ActiveChallenge>,
    markup_failures: u32,
    navigations: Vec<String>,
    scripts: Vec<String>,
    screenshots: u32,
}

impl ScriptedState {
    fn challenge_showing(&mut self) -> Option<&ScriptedChallenge> {
        let expired = self
            .challenge
            .as_ref()
            .and_then(|c| c.clears_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            self.challenge = None;
        }
        self.challenge.as_ref().map(|c| &c.page)
    }
}

/// Scripted browsing session
///
/// All setters take `&self` so a test can change the page while the
/// browser is shared with the code under test.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBrowser {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current URL
    pub fn at_url(self, url: impl Into<String>) -> Self {
        self.state.lock().current_url = url.into();
        self
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.state.lock().title = title.into();
        self
    }

    pub fn with_source(self, source: impl Into<String>) -> Self {
        self.state.lock().source = source.into();
        self
    }

    pub fn with_markup(self, selector: &str, elements: Vec<String>) -> Self {
        self.set_markup(selector, elements);
        self
    }

    pub fn with_cookie(self, cookie: BrowserCookie) -> Self {
        self.state.lock().cookies.push(cookie);
        self
    }

    pub fn with_challenge(self, challenge: ScriptedChallenge) -> Self {
        self.set_challenge(Some(challenge));
        self
    }

    /// Reply with `value` to every script containing `needle`
    pub fn reply_to(self, needle: &str, value: Value) -> Self {
        self.reply_sequence(needle, vec![value]);
        self
    }

    /// Reply to scripts containing `needle` with each value in turn; the last
    /// one repeats
    pub fn reply_sequence(&self, needle: &str, values: Vec<Value>) {
        let mut state = self.state.lock();
        state.replies.retain(|(n, _)| n != needle);
        state.replies.push((needle.to_string(), values.into()));
    }

    /// Navigating to `from` lands on `to`
    pub fn redirect(&self, from: impl Into<String>, to: impl Into<String>) {
        self.state.lock().redirects.insert(from.into(), to.into());
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.state.lock().current_url = url.into();
    }

    pub fn set_markup(&self, selector: &str, elements: Vec<String>) {
        self.state
            .lock()
            .markup
            .insert(selector.to_string(), elements);
    }

    pub fn set_challenge(&self, challenge: Option<ScriptedChallenge>) {
        self.state.lock().challenge = challenge.map(|page| ActiveChallenge {
            clears_at: page.clears_after.map(|after| Instant::now() + after),
            page,
        });
    }

    /// Fail the next `n` markup reads
    pub fn fail_markup_reads(&self, n: u32) {
        self.state.lock().markup_failures = n;
    }

    pub fn is_challenged(&self) -> bool {
        self.state.lock().challenge_showing().is_some()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().navigations.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state.lock().scripts.clone()
    }

    /// Number of executed scripts containing `needle`
    pub fn script_count(&self, needle: &str) -> usize {
        self.state
            .lock()
            .scripts
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }

    pub fn screenshot_count(&self) -> u32 {
        self.state.lock().screenshots
    }
}

#[async_trait]
impl BrowserSession for ScriptedBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.navigations.push(url.to_string());
        state.current_url = state
            .redirects
            .get(url)
            .cloned()
            .unwrap_or_else(|| url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state.lock().current_url.clone())
    }

    async fn title(&self) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(challenge) = state.challenge_showing() {
            return Ok(challenge.title.clone());
        }
        Ok(state.title.clone())
    }

    async fn page_source(&self) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(challenge) = state.challenge_showing() {
            return Ok(challenge.body.clone());
        }
        Ok(state.source.clone())
    }

    async fn page_markup(&self, selector: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        if state.markup_failures > 0 {
            state.markup_failures -= 1;
            return Err(PipelineError::browser("scripted markup failure"));
        }
        if let Some(challenge) = state.challenge_showing() {
            if challenge.markers.iter().any(|m| m == selector) {
                return Ok(vec![format!("<div data-marker=\"{}\"></div>", selector)]);
            }
            return Ok(vec![]);
        }
        Ok(state.markup.get(selector).cloned().unwrap_or_default())
    }

    async fn execute_script(&self, script: &str, _args: Vec<Value>) -> Result<Value> {
        let mut state = self.state.lock();
        state.scripts.push(script.to_string());

        let clears = state
            .challenge
            .as_ref()
            .and_then(|c| c.page.clears_on_script.as_deref())
            .is_some_and(|needle| script.contains(needle));
        if clears {
            state.challenge = None;
        }

        for (needle, replies) in state.replies.iter_mut() {
            if script.contains(needle.as_str()) {
                let value = if replies.len() > 1 {
                    replies.pop_front()
                } else {
                    replies.front().cloned()
                };
                return Ok(value.unwrap_or(Value::Null));
            }
        }
        Ok(Value::Null)
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>> {
        Ok(self.state.lock().cookies.clone())
    }

    async fn set_cookie(&self, cookie: BrowserCookie) -> Result<()> {
        let mut state = self.state.lock();
        state.cookies.retain(|c| c.name != cookie.name);
        state.cookies.push(cookie);
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.state.lock().screenshots += 1;
        Ok(b"\x89PNG\r\n\x1a\n".to_vec())
    }
}

// ============================================================================
// RecordingNotifier - Messaging endpoint that records calls
// ============================================================================

/// One recorded call against the notifier
#[derive(Debug, Clone, PartialEq)]
pub enum NotifierCall {
    Sent { message_id: i64, text: String },
    Attachment {
        message_id: i64,
        caption: String,
        file_name: String,
        size: usize,
    },
    Deleted { message_id: i64 },
    DeleteScheduled { message_id: i64, after: Duration },
    DeleteCancelled { message_id: i64 },
}

#[derive(Debug, Default)]
struct RecorderState {
    next_id: i64,
    calls: Vec<NotifierCall>,
    scheduled: HashMap<i64, tokio::task::AbortHandle>,
    fail_sends: bool,
    fail_attachments: bool,
    min_attachment_bytes: u64,
}

/// Notifier that records every call in order
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    state: Arc<Mutex<RecorderState>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every text send fails
    pub fn failing_sends(self) -> Self {
        self.state.lock().fail_sends = true;
        self
    }

    /// Every attachment upload fails (and falls back to text)
    pub fn failing_attachments(self) -> Self {
        self.state.lock().fail_attachments = true;
        self
    }

    pub fn with_min_attachment_bytes(self, floor: u64) -> Self {
        self.state.lock().min_attachment_bytes = floor;
        self
    }

    pub fn calls(&self) -> Vec<NotifierCall> {
        self.state.lock().calls.clone()
    }

    /// Texts of all sent messages, in order
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                NotifierCall::Sent { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Number of sent texts containing `needle`
    pub fn count_containing(&self, needle: &str) -> usize {
        self.sent_texts()
            .iter()
            .filter(|t| t.contains(needle))
            .count()
    }

    /// Number of attachments delivered
    pub fn attachment_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, NotifierCall::Attachment { .. }))
            .count()
    }

    /// Position in the call log of the first text containing `needle`
    pub fn position_of_text(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(
            |c| matches!(c, NotifierCall::Sent { text, .. } if text.contains(needle)),
        )
    }

    /// Message id of the first text containing `needle`
    pub fn message_id_of(&self, needle: &str) -> Option<i64> {
        self.calls().into_iter().find_map(|c| match c {
            NotifierCall::Sent { message_id, text } if text.contains(needle) => Some(message_id),
            _ => None,
        })
    }

    /// Position in the call log of the delete of `message_id`
    pub fn position_of_delete(&self, message_id: i64) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| *c == NotifierCall::Deleted { message_id })
    }

    /// Position in the call log of the first attachment
    pub fn position_of_attachment(&self) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| matches!(c, NotifierCall::Attachment { .. }))
    }

    pub fn is_deleted(&self, message_id: i64) -> bool {
        self.position_of_delete(message_id).is_some()
    }

    pub fn pending_deletes(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    fn next_id(state: &mut RecorderState) -> i64 {
        state.next_id += 1;
        state.next_id
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<NotificationHandle> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(PipelineError::dispatch("scripted send failure"));
        }
        let message_id = Self::next_id(&mut state);
        state.calls.push(NotifierCall::Sent {
            message_id,
            text: text.to_string(),
        });
        Ok(NotificationHandle::new(message_id))
    }

    async fn send_with_attachment(
        &self,
        attachment: Attachment,
        caption: &str,
    ) -> Option<NotificationHandle> {
        {
            let mut state = self.state.lock();
            if (attachment.len() as u64) < state.min_attachment_bytes {
                return None;
            }
            if !state.fail_attachments {
                let message_id = Self::next_id(&mut state);
                state.calls.push(NotifierCall::Attachment {
                    message_id,
                    caption: caption.to_string(),
                    file_name: attachment.file_name.clone(),
                    size: attachment.len(),
                });
                return Some(NotificationHandle::new(message_id));
            }
        }
        let _ = self.send(&format::upload_fallback(caption)).await;
        None
    }

    async fn delete(&self, handle: &NotificationHandle) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(pending) = state.scheduled.remove(&handle.message_id) {
            pending.abort();
        }
        state.calls.push(NotifierCall::Deleted {
            message_id: handle.message_id,
        });
        Ok(())
    }

    fn schedule_delete(&self, handle: NotificationHandle, after: Duration) -> NotificationHandle {
        let message_id = handle.message_id;
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut state = state.lock();
            if state.scheduled.remove(&message_id).is_some() {
                state.calls.push(NotifierCall::Deleted { message_id });
            }
        });

        let mut guard = self.state.lock();
        if let Some(previous) = guard.scheduled.insert(message_id, task.abort_handle()) {
            previous.abort();
        }
        guard
            .calls
            .push(NotifierCall::DeleteScheduled { message_id, after });

        let at = Utc::now() + chrono::Duration::from_std(after).unwrap_or_default();
        handle.with_delete_at(at)
    }

    fn cancel_scheduled_delete(&self, handle: &NotificationHandle) -> bool {
        let mut state = self.state.lock();
        match state.scheduled.remove(&handle.message_id) {
            Some(pending) => {
                pending.abort();
                state.calls.push(NotifierCall::DeleteCancelled {
                    message_id: handle.message_id,
                });
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_browser_replies() {
        let browser = ScriptedBrowser::new()
            .at_url("https://feed.test/live")
            .reply_to("navigator.userAgent", json!("TestAgent/1.0"));
        browser.reply_sequence("recordedAudioData", vec![Value::Null, json!("data:x")]);

        assert_eq!(browser.user_agent().await.unwrap().as_deref(), Some("TestAgent/1.0"));
        assert_eq!(
            browser.execute_script("return window.recordedAudioData", vec![]).await.unwrap(),
            Value::Null
        );
        assert_eq!(
            browser.execute_script("return window.recordedAudioData", vec![]).await.unwrap(),
            json!("data:x")
        );
        assert_eq!(
            browser.execute_script("return window.recordedAudioData", vec![]).await.unwrap(),
            json!("data:x")
        );
        assert_eq!(browser.script_count("recordedAudioData"), 3);
    }

    #[tokio::test]
    async fn test_scripted_challenge_clears_on_script() {
        let browser = ScriptedBrowser::new()
            .with_title("Live Calls")
            .with_challenge(ScriptedChallenge::cloudflare().clears_on_script("submit()"));

        assert_eq!(browser.title().await.unwrap(), "Just a moment...");
        assert!(browser.exists("iframe[src*='challenge']").await.unwrap());

        browser.execute_script("form.submit()", vec![]).await.unwrap();
        assert!(!browser.is_challenged());
        assert_eq!(browser.title().await.unwrap(), "Live Calls");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_challenge_clears_after() {
        let browser = ScriptedBrowser::new()
            .with_challenge(ScriptedChallenge::cloudflare().clears_after(Duration::from_secs(60)));
        assert!(browser.is_challenged());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!browser.is_challenged());
    }

    #[tokio::test]
    async fn test_scripted_browser_redirect_and_failures() {
        let browser = ScriptedBrowser::new();
        browser.redirect("https://feed.test/live", "https://feed.test/login");
        browser.navigate("https://feed.test/live").await.unwrap();
        assert_eq!(browser.current_url().await.unwrap(), "https://feed.test/login");

        browser.fail_markup_reads(1);
        assert!(browser.page_markup("tr").await.is_err());
        assert!(browser.page_markup("tr").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recording_notifier_order() {
        let notifier = RecordingNotifier::new();
        let first = notifier.send("detected").await.unwrap();
        notifier.delete(&first).await.unwrap();
        notifier
            .send_with_attachment(Attachment::new("a.mp3", vec![0; 10]), "caption")
            .await
            .unwrap();

        assert_eq!(notifier.position_of_text("detected"), Some(0));
        assert_eq!(notifier.position_of_delete(first.message_id), Some(1));
        assert_eq!(notifier.position_of_attachment(), Some(2));
    }

    #[tokio::test]
    async fn test_recording_notifier_attachment_fallback() {
        let notifier = RecordingNotifier::new().failing_attachments();
        let handle = notifier
            .send_with_attachment(Attachment::new("a.mp3", vec![0; 10]), "the caption")
            .await;
        assert!(handle.is_none());
        assert_eq!(notifier.count_containing("the caption"), 1);
        assert_eq!(notifier.attachment_count(), 0);
    }

    #[tokio::test]
    async fn test_recording_notifier_below_floor() {
        let notifier = RecordingNotifier::new().with_min_attachment_bytes(100);
        let handle = notifier
            .send_with_attachment(Attachment::new("a.mp3", vec![0; 10]), "caption")
            .await;
        assert!(handle.is_none());
        assert!(notifier.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_notifier_scheduled_delete() {
        let notifier = RecordingNotifier::new();
        let handle = notifier.send("pausing").await.unwrap();
        let handle = notifier.schedule_delete(handle, Duration::from_secs(10));
        assert!(handle.is_ephemeral());
        assert_eq!(notifier.pending_deletes(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(notifier.is_deleted(handle.message_id));
        assert_eq!(notifier.pending_deletes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_notifier_cancel_delete() {
        let notifier = RecordingNotifier::new();
        let handle = notifier.send("status").await.unwrap();
        let handle = notifier.schedule_delete(handle, Duration::from_secs(10));
        assert!(notifier.cancel_scheduled_delete(&handle));
        assert!(!notifier.cancel_scheduled_delete(&handle));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!notifier.is_deleted(handle.message_id));
    }
}
