// Access Gate
//
// Owns the Session state for the shared browser. Callers ask for a usable
// session at a URL and get back Usable or Blocked; challenge detection,
// bypass strategies and the manual escalation wait all stay in here.
//
// The browser lock is taken per operation and released across every sleep,
// so the polling loop and workers are never held up by a manual wait.

use std::sync::Arc;
use std::time::Duration;

use callrelay_core::format;
use callrelay_core::{
    GateConfig, Notifier, Session, SessionAccess, SharedBrowser, SiteConfig,
};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::bypass::{default_strategies, BypassStrategy};
use crate::challenge::{ChallengeFingerprints, ChallengeMatch};
use crate::diagnostics::Diagnostics;

/// Which manual-wait ceiling applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Initial login, the operator may need a while
    Login,
    /// Nuisance challenges while monitoring
    SteadyState,
}

impl AccessMode {
    pub fn ceiling(&self, config: &GateConfig) -> Duration {
        match self {
            AccessMode::Login => config.login_ceiling,
            AccessMode::SteadyState => config.steady_ceiling,
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Login => write!(f, "login"),
            AccessMode::SteadyState => write!(f, "steady_state"),
        }
    }
}

/// Challenge-gated access to the shared browsing session
pub struct AccessGate {
    browser: SharedBrowser,
    notifier: Arc<dyn Notifier>,
    fingerprints: ChallengeFingerprints,
    strategies: Vec<Box<dyn BypassStrategy>>,
    config: GateConfig,
    diagnostics: Diagnostics,
    session: Mutex<Session>,
}

impl AccessGate {
    pub fn new(browser: SharedBrowser, notifier: Arc<dyn Notifier>, config: GateConfig) -> Self {
        Self {
            browser,
            notifier,
            fingerprints: ChallengeFingerprints::default(),
            strategies: default_strategies(),
            config,
            diagnostics: Diagnostics::disabled(),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn with_fingerprints(mut self, fingerprints: ChallengeFingerprints) -> Self {
        self.fingerprints = fingerprints;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn BypassStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Copy of the current session state
    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    pub fn is_usable(&self) -> bool {
        self.session.lock().usable
    }

    /// Navigate to `url` and make sure the page is not behind a challenge
    #[instrument(skip(self), fields(mode = %mode))]
    pub async fn ensure_session(&self, url: &str, mode: AccessMode) -> SessionAccess {
        let detected = {
            let browser = self.browser.lock().await;
            if let Err(e) = browser.navigate(url).await {
                warn!(%url, error = %e, "Navigation failed");
                return self.blocked();
            }
            self.fingerprints.detect(&*browser).await
        };

        match detected {
            Ok(None) => self.usable(),
            Ok(Some(challenge)) => self.resolve(url, challenge, mode).await,
            Err(e) => {
                warn!(%url, error = %e, "Cannot inspect page");
                self.blocked()
            }
        }
    }

    /// Same as `ensure_session` for the page already loaded
    #[instrument(skip(self), fields(mode = %mode))]
    pub async fn check_current(&self, mode: AccessMode) -> SessionAccess {
        let (url, detected) = {
            let browser = self.browser.lock().await;
            let url = browser.current_url().await.unwrap_or_default();
            (url, self.fingerprints.detect(&*browser).await)
        };

        match detected {
            Ok(None) => self.usable(),
            Ok(Some(challenge)) => self.resolve(&url, challenge, mode).await,
            Err(e) => {
                warn!(error = %e, "Cannot inspect page");
                self.blocked()
            }
        }
    }

    /// Load the login page and wait for the operator to sign in
    ///
    /// Returns Usable straight away when the site already considers the
    /// session logged in. Otherwise sends one "login required" message and
    /// one success or timeout message.
    #[instrument(skip(self, site))]
    pub async fn await_login(&self, site: &SiteConfig) -> SessionAccess {
        if !self
            .ensure_session(&site.login_url, AccessMode::Login)
            .await
            .is_usable()
        {
            return SessionAccess::Blocked;
        }
        if self.on_logged_in_page(site).await {
            info!("Session already logged in");
            return self.usable();
        }

        let ceiling = self.config.login_ceiling;
        info!(ceiling_secs = ceiling.as_secs(), "Waiting for manual login");
        if let Err(e) = self
            .notifier
            .send(&format::login_required(&site.login_url, ceiling))
            .await
        {
            warn!(error = %e, "Login notification failed");
        }

        let started = Instant::now();
        while started.elapsed() < ceiling {
            let wait = self.config.manual_poll_interval.min(ceiling - started.elapsed());
            tokio::time::sleep(wait).await;

            if self.on_logged_in_page(site).await {
                info!(waited_secs = started.elapsed().as_secs(), "Login completed");
                if let Err(e) = self.notifier.send(&format::login_succeeded()).await {
                    warn!(error = %e, "Login notification failed");
                }
                return self.usable();
            }
        }

        warn!(waited_secs = ceiling.as_secs(), "Manual login timed out");
        if let Err(e) = self.notifier.send(&format::login_timed_out(ceiling)).await {
            warn!(error = %e, "Login notification failed");
        }
        self.blocked()
    }

    async fn on_logged_in_page(&self, site: &SiteConfig) -> bool {
        let browser = self.browser.lock().await;
        match browser.current_url().await {
            Ok(url) => site.is_logged_in_page(&url),
            Err(e) => {
                debug!(error = %e, "Cannot read current URL");
                false
            }
        }
    }

    async fn resolve(&self, url: &str, challenge: ChallengeMatch, mode: AccessMode) -> SessionAccess {
        warn!(
            %url,
            challenge = %challenge.kind,
            signal = ?challenge.signal,
            indicator = %challenge.indicator,
            "Challenge detected"
        );
        self.session.lock().mark_challenged(challenge.kind.clone());

        if self.try_strategies(&challenge).await {
            return self.usable();
        }
        self.escalate(url, &challenge, mode).await
    }

    /// Run the strategies in order until one clears the page
    async fn try_strategies(&self, challenge: &ChallengeMatch) -> bool {
        for strategy in &self.strategies {
            let name = strategy.name();
            let outcome = {
                let browser = self.browser.lock().await;
                tokio::time::timeout(self.config.strategy_timeout, strategy.attempt(&*browser, challenge))
                    .await
            };

            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    debug!(strategy = name, "Nothing to interact with");
                    continue;
                }
                Ok(Err(e)) => {
                    debug!(strategy = name, error = %e, "Strategy failed");
                    continue;
                }
                Err(_) => {
                    debug!(strategy = name, timeout_secs = self.config.strategy_timeout.as_secs(), "Strategy timed out");
                    continue;
                }
            }

            tokio::time::sleep(self.config.settle_delay).await;
            match self.detect_now().await {
                Some(false) => {
                    info!(strategy = name, challenge = %challenge.kind, "Challenge cleared");
                    return true;
                }
                _ => debug!(strategy = name, "Challenge still present after settle"),
            }
        }
        false
    }

    /// Notify the operator and wait for the page to clear
    async fn escalate(&self, url: &str, challenge: &ChallengeMatch, mode: AccessMode) -> SessionAccess {
        let ceiling = mode.ceiling(&self.config);
        warn!(%url, challenge = %challenge.kind, ceiling_secs = ceiling.as_secs(), "Bypass failed, waiting for manual action");

        {
            let browser = self.browser.lock().await;
            self.diagnostics.screenshot(&*browser, "challenge").await;
        }
        if let Err(e) = self
            .notifier
            .send(&format::challenge_escalation(url, &challenge.kind, ceiling))
            .await
        {
            warn!(error = %e, "Escalation notification failed");
        }

        let started = Instant::now();
        while started.elapsed() < ceiling {
            let wait = self.config.manual_poll_interval.min(ceiling - started.elapsed());
            tokio::time::sleep(wait).await;

            if self.detect_now().await == Some(false) {
                info!(%url, waited_secs = started.elapsed().as_secs(), "Challenge solved manually");
                if let Err(e) = self.notifier.send(&format::challenge_cleared(url)).await {
                    warn!(error = %e, "Clearance notification failed");
                }
                return self.usable();
            }
        }

        warn!(%url, waited_secs = ceiling.as_secs(), "Manual challenge wait timed out");
        if let Err(e) = self.notifier.send(&format::manual_timeout(url, ceiling)).await {
            warn!(error = %e, "Timeout notification failed");
        }
        self.blocked()
    }

    /// Some(true) while challenged, None when the page cannot be read
    async fn detect_now(&self) -> Option<bool> {
        let browser = self.browser.lock().await;
        match self.fingerprints.detect(&*browser).await {
            Ok(found) => Some(found.is_some()),
            Err(e) => {
                debug!(error = %e, "Cannot inspect page");
                None
            }
        }
    }

    fn usable(&self) -> SessionAccess {
        self.session.lock().mark_usable(Utc::now());
        SessionAccess::Usable
    }

    fn blocked(&self) -> SessionAccess {
        self.session.lock().mark_blocked();
        SessionAccess::Blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use callrelay_core::memory::{RecordingNotifier, ScriptedBrowser, ScriptedChallenge};
    use callrelay_core::BrowserSession;
    use serde_json::json;

    const LIVE: &str = "https://feed.test/live/calls";

    fn gate(browser: &ScriptedBrowser, notifier: &RecordingNotifier) -> AccessGate {
        AccessGate::new(
            SharedBrowser::new(Arc::new(browser.clone())),
            Arc::new(notifier.clone()),
            GateConfig::default(),
        )
    }

    struct Hangs;

    #[async_trait]
    impl BypassStrategy for Hangs {
        fn name(&self) -> &'static str {
            "hangs"
        }

        async fn attempt(
            &self,
            _browser: &dyn BrowserSession,
            _challenge: &ChallengeMatch,
        ) -> callrelay_core::Result<bool> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_clean_page_is_usable() {
        let browser = ScriptedBrowser::new().with_title("Live Calls");
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        assert_eq!(gate.ensure_session(LIVE, AccessMode::SteadyState).await, SessionAccess::Usable);
        assert!(gate.is_usable());
        assert!(gate.session().last_refresh_at.is_some());
        assert_eq!(browser.navigations(), vec![LIVE.to_string()]);
        assert!(notifier.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_strategies_fail_then_ceiling() {
        let browser = ScriptedBrowser::new().with_challenge(ScriptedChallenge::cloudflare());
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        let started = Instant::now();
        let access = gate.ensure_session(LIVE, AccessMode::SteadyState).await;

        assert_eq!(access, SessionAccess::Blocked);
        assert_eq!(notifier.count_containing("CAPTCHA Detected"), 1);
        assert_eq!(notifier.count_containing("CAPTCHA Timeout"), 1);
        assert_eq!(notifier.sent_texts().len(), 2);
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(started.elapsed() < Duration::from_secs(150));

        let session = gate.session();
        assert!(!session.usable);
        assert_eq!(session.challenge_type.as_deref(), Some("cloudflare"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_form_strategy_clears_challenge() {
        let browser = ScriptedBrowser::new()
            .with_challenge(ScriptedChallenge::cloudflare().clears_on_script("requestSubmit"))
            .reply_to("requestSubmit", json!(true));
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        assert_eq!(gate.ensure_session(LIVE, AccessMode::SteadyState).await, SessionAccess::Usable);
        assert!(notifier.calls().is_empty());
        assert_eq!(gate.session().challenge_type, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_clearance_within_ceiling() {
        let browser = ScriptedBrowser::new()
            .with_challenge(ScriptedChallenge::cloudflare().clears_after(Duration::from_secs(45)));
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        assert_eq!(gate.ensure_session(LIVE, AccessMode::SteadyState).await, SessionAccess::Usable);
        assert_eq!(notifier.count_containing("CAPTCHA Detected"), 1);
        assert_eq!(notifier.count_containing("CAPTCHA Solved"), 1);
        assert_eq!(notifier.count_containing("CAPTCHA Timeout"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_strategy_is_timed_out() {
        let browser = ScriptedBrowser::new()
            .with_challenge(ScriptedChallenge::cloudflare().clears_on_script("requestSubmit"))
            .reply_to("requestSubmit", json!(true));
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier).with_strategies(vec![
            Box::new(Hangs),
            Box::new(crate::bypass::FormSubmit),
        ]);

        let started = Instant::now();
        assert_eq!(gate.ensure_session(LIVE, AccessMode::SteadyState).await, SessionAccess::Usable);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(notifier.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_ceiling_applies_in_login_mode() {
        let browser = ScriptedBrowser::new()
            .with_challenge(ScriptedChallenge::cloudflare().clears_after(Duration::from_secs(600)));
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        assert_eq!(
            gate.ensure_session("https://feed.test/login", AccessMode::Login).await,
            SessionAccess::Usable
        );
        assert_eq!(notifier.count_containing("CAPTCHA Timeout"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_login_waits_for_operator() {
        let site = SiteConfig::default().with_base_url("https://feed.test");
        let browser = ScriptedBrowser::new();
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        let operator = browser.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(100)).await;
            operator.set_url("https://feed.test/dashboard");
        });

        assert_eq!(gate.await_login(&site).await, SessionAccess::Usable);
        assert_eq!(notifier.count_containing("Login Required"), 1);
        assert_eq!(notifier.count_containing("Login Successful"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_login_times_out() {
        let site = SiteConfig::default().with_base_url("https://feed.test");
        let browser = ScriptedBrowser::new();
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        assert_eq!(gate.await_login(&site).await, SessionAccess::Blocked);
        assert_eq!(notifier.count_containing("Login Required"), 1);
        assert_eq!(notifier.count_containing("Login Timeout"), 1);
        assert!(!gate.is_usable());
    }

    #[tokio::test]
    async fn test_await_login_skips_when_logged_in() {
        let site = SiteConfig::default().with_base_url("https://feed.test");
        let browser = ScriptedBrowser::new();
        browser.redirect(site.login_url.clone(), "https://feed.test/live/calls");
        let notifier = RecordingNotifier::new();
        let gate = gate(&browser, &notifier);

        assert_eq!(gate.await_login(&site).await, SessionAccess::Usable);
        assert!(notifier.calls().is_empty());
    }
}
