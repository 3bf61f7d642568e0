//! Refresh Scheduler
//!
//! Forces a session refresh on a rotating list of intervals. The polling loop
//! runs the refresh in place of a cycle, so the tracker is paused for the
//! whole refresh window.

use std::time::Duration;

use callrelay_browser::{AccessGate, AccessMode, FeedSnapshotter};
use callrelay_core::{format, Notifier, RefreshConfig};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Rotating refresh timer
#[derive(Debug)]
pub struct RefreshScheduler {
    config: RefreshConfig,
    /// Index of the interval used for the next delay
    cursor: usize,
    due_at: Option<Instant>,
    ephemeral_after: Duration,
}

impl RefreshScheduler {
    pub fn new(config: RefreshConfig, ephemeral_after: Duration) -> Self {
        let mut scheduler = Self {
            config,
            cursor: 0,
            due_at: None,
            ephemeral_after,
        };
        scheduler.due_at = scheduler.next_delay().map(|d| Instant::now() + d);
        scheduler
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.intervals.is_empty()
    }

    /// Next interval in the rotation
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let delay = self.config.intervals[self.cursor % self.config.intervals.len()];
        self.cursor = (self.cursor + 1) % self.config.intervals.len();
        Some(delay)
    }

    fn shortest(&self) -> Option<Duration> {
        self.config.intervals.iter().min().copied()
    }

    /// When the next refresh is due
    pub fn due_at(&self) -> Option<Instant> {
        self.due_at
    }

    pub fn is_due(&self) -> bool {
        self.due_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Refresh the feed page through the gate
    ///
    /// Sends a short-lived "pausing" message first and a short-lived
    /// "resumed" message once the session is usable and the feed table is
    /// back. A failed refresh is retried after the shortest interval; the
    /// gate has already escalated to the operator by then. A disabled
    /// scheduler can still be asked to refresh but is never re-armed.
    #[instrument(skip_all)]
    pub async fn refresh(
        &mut self,
        gate: &AccessGate,
        snapshotter: &FeedSnapshotter,
        notifier: &dyn Notifier,
        feed_url: &str,
    ) -> bool {
        info!("Refreshing session");
        if let Err(e) = notifier
            .send_ephemeral(&format::refresh_pausing(), self.ephemeral_after)
            .await
        {
            warn!(error = %e, "Refresh notification failed");
        }

        let ok = gate
            .ensure_session(feed_url, AccessMode::SteadyState)
            .await
            .is_usable()
            && snapshotter.locate_feed().await;

        let next = if ok {
            info!("Session refreshed");
            if let Err(e) = notifier
                .send_ephemeral(&format::refresh_resumed(), self.ephemeral_after)
                .await
            {
                warn!(error = %e, "Refresh notification failed");
            }
            self.next_delay()
        } else {
            warn!("Session refresh failed");
            self.is_enabled().then(|| self.shortest()).flatten()
        };

        self.due_at = next.map(|d| Instant::now() + d);
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callrelay_core::memory::{RecordingNotifier, ScriptedBrowser, ScriptedChallenge};
    use callrelay_core::{GateConfig, SharedBrowser, SiteConfig};
    use std::sync::Arc;

    const FEED: &str = "https://feed.example.com/live/calls";

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_rotation() {
        let config = RefreshConfig::default().with_intervals(secs(&[300, 370, 200]));
        let mut scheduler = RefreshScheduler::new(config, Duration::from_secs(10));

        assert_eq!(scheduler.next_delay(), Some(Duration::from_secs(370)));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_secs(200)));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_secs(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_due() {
        let mut scheduler = RefreshScheduler::new(RefreshConfig::disabled(), Duration::from_secs(10));
        assert!(scheduler.due_at().is_none());
        assert!(scheduler.next_delay().is_none());
        tokio::time::advance(Duration::from_secs(10_000)).await;
        assert!(!scheduler.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_refresh_due_after_first_interval() {
        let config = RefreshConfig::default().with_intervals(secs(&[60, 90]));
        let scheduler = RefreshScheduler::new(config, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!scheduler.is_due());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(scheduler.is_due());
    }

    fn fixture(browser: &ScriptedBrowser, notifier: &RecordingNotifier) -> (AccessGate, FeedSnapshotter) {
        let shared = SharedBrowser::new(Arc::new(browser.clone()));
        let gate = AccessGate::new(
            shared.clone(),
            Arc::new(notifier.clone()),
            GateConfig::default().with_ceilings(Duration::from_secs(60), Duration::from_secs(20)),
        )
        .with_strategies(vec![]);
        let site = SiteConfig::default().with_base_url("https://feed.example.com");
        let snapshotter = FeedSnapshotter::new(shared, &site).unwrap();
        (gate, snapshotter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_success_sends_ephemeral_messages() {
        let browser = ScriptedBrowser::new().with_markup("#LiveCalls", vec!["<table id=\"LiveCalls\"></table>".to_string()]);
        let notifier = RecordingNotifier::new();
        let (gate, snapshotter) = fixture(&browser, &notifier);
        let config = RefreshConfig::default().with_intervals(secs(&[60, 90]));
        let mut scheduler = RefreshScheduler::new(config, Duration::from_secs(10));

        assert!(scheduler.refresh(&gate, &snapshotter, &notifier, FEED).await);
        assert_eq!(browser.navigations(), vec![FEED.to_string()]);
        assert_eq!(notifier.count_containing("Refreshing session"), 1);
        assert_eq!(notifier.count_containing("Monitoring resumed"), 1);
        assert_eq!(notifier.pending_deletes(), 2);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(notifier.pending_deletes(), 0);
        assert!(notifier.is_deleted(1));
        assert!(notifier.is_deleted(2));

        // 90s is next in the rotation; 11s have passed since the refresh
        tokio::time::advance(Duration::from_secs(78)).await;
        assert!(!scheduler.is_due());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(scheduler.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_uses_shortest_interval() {
        let browser = ScriptedBrowser::new().with_challenge(ScriptedChallenge::cloudflare());
        let notifier = RecordingNotifier::new();
        let (gate, snapshotter) = fixture(&browser, &notifier);
        let config = RefreshConfig::default().with_intervals(secs(&[300, 120, 200]));
        let mut scheduler = RefreshScheduler::new(config, Duration::from_secs(10));

        assert!(!scheduler.refresh(&gate, &snapshotter, &notifier, FEED).await);
        assert_eq!(notifier.count_containing("Monitoring resumed"), 0);
        assert_eq!(notifier.count_containing("CAPTCHA Timeout"), 1);

        let due_in = scheduler.due_at().unwrap() - Instant::now();
        assert_eq!(due_in, Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_scheduler_never_rearms() {
        let browser = ScriptedBrowser::new().with_challenge(ScriptedChallenge::cloudflare());
        let notifier = RecordingNotifier::new();
        let (gate, snapshotter) = fixture(&browser, &notifier);
        let mut scheduler = RefreshScheduler::new(RefreshConfig::disabled(), Duration::from_secs(10));

        assert!(!scheduler.refresh(&gate, &snapshotter, &notifier, FEED).await);
        assert!(scheduler.due_at().is_none());
        tokio::time::advance(Duration::from_secs(10_000)).await;
        assert!(!scheduler.is_due());

        browser.set_challenge(None);
        browser.set_markup("#LiveCalls", vec!["<table id=\"LiveCalls\"></table>".to_string()]);
        assert!(scheduler.refresh(&gate, &snapshotter, &notifier, FEED).await);
        assert!(scheduler.due_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_without_feed_table_fails() {
        let browser = ScriptedBrowser::new();
        let notifier = RecordingNotifier::new();
        let (gate, snapshotter) = fixture(&browser, &notifier);
        let mut scheduler = RefreshScheduler::new(RefreshConfig::default(), Duration::from_secs(10));

        assert!(!scheduler.refresh(&gate, &snapshotter, &notifier, FEED).await);
        assert_eq!(notifier.count_containing("Monitoring resumed"), 0);
    }
}
