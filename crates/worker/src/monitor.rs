//! Monitor loop
//!
//! The single polling loop: it owns the tracker, is the only caller of the
//! snapshotter, and hands completed events to the coordinator without ever
//! waiting on a worker.

use std::sync::Arc;
use std::time::Duration;

use callrelay_browser::{AccessGate, AccessMode, BypassStrategy, Diagnostics, FeedSnapshotter};
use callrelay_core::{
    format, Event, MonitorConfig, Notifier, PipelineError, RegionLookup, Result, SessionSnapshot,
    SharedBrowser,
};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::pool::{Coordinator, HandOff, RetrievalContext, SubmitError, WorkerOutcome};
use crate::reliability::RetryPolicy;
use crate::refresh::RefreshScheduler;
use crate::retriever::ArtifactRetriever;
use crate::tracker::LifecycleTracker;

/// Why the monitor stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested
    Shutdown,
    /// The operator never completed the login
    LoginFailed,
    /// Too many consecutive polling cycles failed
    TooManyErrors(u32),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Shutdown => write!(f, "Shutdown requested"),
            StopReason::LoginFailed => write!(f, "Login was not completed"),
            StopReason::TooManyErrors(n) => write!(f, "{} consecutive errors", n),
        }
    }
}

/// The call feed monitor
pub struct Monitor {
    config: MonitorConfig,
    browser: SharedBrowser,
    notifier: Arc<dyn Notifier>,
    regions: Arc<dyn RegionLookup>,
    gate: AccessGate,
    snapshotter: FeedSnapshotter,
    tracker: LifecycleTracker,
    coordinator: Coordinator,
    refresh: RefreshScheduler,
    diagnostics: Diagnostics,
    started_at: Instant,
    next_status_at: Instant,
    consecutive_errors: u32,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        browser: SharedBrowser,
        notifier: Arc<dyn Notifier>,
        regions: Arc<dyn RegionLookup>,
    ) -> Result<Self> {
        let diagnostics = Diagnostics::new(config.tracker.screenshot_folder.clone());
        let gate = AccessGate::new(browser.clone(), notifier.clone(), config.gate.clone())
            .with_diagnostics(diagnostics.clone());
        let snapshotter = FeedSnapshotter::new(browser.clone(), &config.site)?;
        let tracker = LifecycleTracker::new(
            config.tracker.clone(),
            config.site.correlation_prefix.clone(),
        );

        let context = RetrievalContext {
            retriever: ArtifactRetriever::standard(browser.clone(), &config.site, &config.retrieval)?,
            notifier: notifier.clone(),
            regions: regions.clone(),
            site: config.site.clone(),
            policy: RetryPolicy::from_config(&config.retrieval),
            progress_updates: config.retrieval.progress_updates,
        };
        let coordinator = Coordinator::new(context, config.pool.clone());
        let refresh = RefreshScheduler::new(config.refresh.clone(), config.dispatch.ephemeral_after);

        let now = Instant::now();
        Ok(Self {
            next_status_at: now + config.tracker.status_report_interval,
            config,
            browser,
            notifier,
            regions,
            gate,
            snapshotter,
            tracker,
            coordinator,
            refresh,
            diagnostics,
            started_at: now,
            consecutive_errors: 0,
        })
    }

    /// Replace the gate's bypass strategies
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn BypassStrategy>>) -> Self {
        self.gate = self.gate.with_strategies(strategies);
        self
    }

    /// Report each worker's terminal outcome on `tx`
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<WorkerOutcome>) -> Self {
        self.coordinator = self.coordinator.with_outcomes(tx);
        self
    }

    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Log in, open the feed and announce the start
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> std::result::Result<(), StopReason> {
        info!(feed = %self.config.site.feed_url, "Starting monitor");
        if !self.gate.await_login(&self.config.site).await.is_usable() {
            error!("Login was not completed");
            return Err(StopReason::LoginFailed);
        }
        if !self
            .gate
            .ensure_session(&self.config.site.feed_url, AccessMode::SteadyState)
            .await
            .is_usable()
        {
            warn!("Feed page not usable yet, polling will retry");
        }

        self.send(&format::monitor_started(Utc::now())).await;
        Ok(())
    }

    /// Run until shutdown or an unrecoverable condition
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> StopReason {
        let reason = match self.start().await {
            Ok(()) => loop {
                if *shutdown.borrow() {
                    break StopReason::Shutdown;
                }

                match self.poll_once().await {
                    Ok(()) => self.consecutive_errors = 0,
                    Err(e) => {
                        self.consecutive_errors += 1;
                        error!(
                            error = %e,
                            consecutive = self.consecutive_errors,
                            "Polling cycle failed"
                        );
                        if self.consecutive_errors >= self.config.tracker.max_consecutive_errors {
                            break StopReason::TooManyErrors(self.consecutive_errors);
                        }
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.config.tracker.poll_interval) => {}
                    _ = shutdown.changed() => break StopReason::Shutdown,
                }
            },
            Err(reason) => reason,
        };

        self.stop(&reason).await;
        reason
    }

    /// One polling cycle
    ///
    /// A due refresh replaces the cycle. Otherwise: re-login if the session
    /// expired, snapshot the feed, notify new rows and hand off completed
    /// ones. A single failed snapshot is skipped; reaching the failure
    /// ceiling forces a refresh.
    pub async fn poll_once(&mut self) -> Result<()> {
        if self.refresh.is_due() {
            self.refresh_session().await?;
            return Ok(());
        }
        self.maybe_report_status().await;

        if self.session_expired().await {
            warn!("Session expired, logging in again");
            self.send(&format::session_expired()).await;
            if !self.gate.await_login(&self.config.site).await.is_usable() {
                return Err(PipelineError::SessionBlocked {
                    url: self.config.site.login_url.clone(),
                });
            }
            self.gate
                .ensure_session(&self.config.site.feed_url, AccessMode::SteadyState)
                .await;
        }

        let rows = match self.snapshotter.snapshot().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Snapshot failed, skipping cycle");
                {
                    let browser = self.browser.lock().await;
                    self.diagnostics.screenshot(&*browser, "snapshot_failure").await;
                }
                if self.tracker.record_snapshot_failure() {
                    if self.gate.check_current(AccessMode::SteadyState).await.is_usable() {
                        self.refresh_session().await?;
                    } else {
                        return Err(PipelineError::SessionBlocked {
                            url: self.config.site.feed_url.clone(),
                        });
                    }
                }
                return Ok(());
            }
        };

        let observation = self.tracker.observe(&rows, Utc::now());

        for event in &observation.detected {
            let region = self.regions.lookup(&event.endpoint);
            match self.notifier.send(&format::detected(event, &region)).await {
                Ok(handle) => {
                    if let Some(stale) = self.tracker.attach_status(&event.row_id, handle) {
                        self.delete(&stale).await;
                    }
                }
                Err(e) => warn!(row_id = %event.row_id, error = %e, "Detected notification failed"),
            }
        }

        if !observation.completed.is_empty() {
            let session = self.session_snapshot().await;
            for event in observation.completed {
                self.hand_off(event, session.clone()).await;
            }
        }

        debug!(
            rows = rows.len(),
            active = self.tracker.active_count(),
            in_flight = self.coordinator.in_flight(),
            "Cycle complete"
        );
        Ok(())
    }

    async fn hand_off(&self, event: Event, session: SessionSnapshot) {
        let row_id = event.row_id.clone();
        let status = event.status_message.clone();
        info!(%row_id, endpoint = %event.endpoint, "Event completed, handing off");

        match self.coordinator.submit(HandOff { event, session }) {
            Ok(()) => {}
            Err(SubmitError::AlreadyClaimed(_)) => {
                // The earlier worker for this row id owns the conversation
                if let Some(status) = status {
                    self.delete(&status).await;
                }
            }
            Err(e) => {
                warn!(%row_id, error = %e, "Hand-off refused");
                if let Some(status) = status {
                    self.delete(&status).await;
                }
            }
        }
    }

    async fn refresh_session(&mut self) -> Result<()> {
        let ok = self
            .refresh
            .refresh(
                &self.gate,
                &self.snapshotter,
                self.notifier.as_ref(),
                &self.config.site.feed_url,
            )
            .await;
        if ok {
            Ok(())
        } else {
            Err(PipelineError::SessionBlocked {
                url: self.config.site.feed_url.clone(),
            })
        }
    }

    async fn session_expired(&self) -> bool {
        let browser = self.browser.lock().await;
        match browser.current_url().await {
            Ok(url) => self.config.site.is_login_page(&url),
            Err(e) => {
                debug!(error = %e, "Cannot read current URL");
                false
            }
        }
    }

    /// Cookies and user agent for workers that download outside the browser
    async fn session_snapshot(&self) -> SessionSnapshot {
        let browser = self.browser.lock().await;
        let cookies = browser.cookies().await.unwrap_or_else(|e| {
            warn!(error = %e, "Cannot read cookies");
            Vec::new()
        });
        let user_agent = browser
            .user_agent()
            .await
            .ok()
            .flatten()
            .or_else(|| self.config.webdriver.user_agent.clone());
        SessionSnapshot::new(cookies, user_agent)
    }

    async fn maybe_report_status(&mut self) {
        if Instant::now() < self.next_status_at {
            return;
        }
        self.next_status_at = Instant::now() + self.config.tracker.status_report_interval;
        let text = format::status_report(
            self.tracker.active_count(),
            self.coordinator.in_flight(),
            self.uptime(),
            Utc::now(),
        );
        self.send(&text).await;
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    async fn stop(&mut self, reason: &StopReason) {
        info!(%reason, "Stopping monitor");
        for event in self.tracker.drain() {
            if let Some(status) = event.status_message {
                self.delete(&status).await;
            }
        }
        if let Err(e) = self.coordinator.shutdown().await {
            warn!(error = %e, "Worker pool did not drain");
        }
        self.send(&format::monitor_stopped(&reason.to_string())).await;
    }

    async fn send(&self, text: &str) {
        if let Err(e) = self.notifier.send(text).await {
            warn!(error = %e, "Notification failed");
        }
    }

    async fn delete(&self, handle: &callrelay_core::NotificationHandle) {
        if let Err(e) = self.notifier.delete(handle).await {
            debug!(message_id = handle.message_id, error = %e, "Delete failed");
        }
    }
}
