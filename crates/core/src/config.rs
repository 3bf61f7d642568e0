// Monitor configuration
//
// Every tunable is a flat named value read from the environment at startup.
// Durations are read as whole seconds and carried as milliseconds when
// serialized.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Top-level configuration for one monitor process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub site: SiteConfig,
    pub tracker: TrackerConfig,
    pub retrieval: RetrievalConfig,
    pub dispatch: DispatchConfig,
    pub gate: GateConfig,
    pub refresh: RefreshConfig,
    pub pool: PoolConfig,
    pub webdriver: WebDriverConfig,
}

impl MonitorConfig {
    /// Create configuration from environment variables
    ///
    /// Unset or unparsable values fall back to their defaults; credentials
    /// and URLs are checked later by [`MonitorConfig::validate`].
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a fixed set of values
    pub fn from_map(values: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        Self {
            site: SiteConfig::from_env_with(&env),
            tracker: TrackerConfig::from_env_with(&env),
            retrieval: RetrievalConfig::from_env_with(&env),
            dispatch: DispatchConfig::from_env_with(&env),
            gate: GateConfig::from_env_with(&env),
            refresh: RefreshConfig::from_env_with(&env),
            pool: PoolConfig::from_env_with(&env),
            webdriver: WebDriverConfig::from_env_with(&env),
        }
    }

    /// Check the values the monitor cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.bot_token.trim().is_empty() {
            return Err(PipelineError::config("BOT_TOKEN is required"));
        }
        if self.dispatch.chat_id.trim().is_empty() {
            return Err(PipelineError::config("CHAT_ID is required"));
        }
        for (name, value) in [
            ("BASE_URL", &self.site.base_url),
            ("LOGIN_URL", &self.site.login_url),
            ("CALL_URL", &self.site.feed_url),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::config(format!("{} is required", name)));
            }
        }
        if self.refresh.enabled && self.refresh.intervals.is_empty() {
            return Err(PipelineError::config(
                "REFRESH_INTERVALS must list at least one interval",
            ));
        }
        if self.pool.capacity == 0 {
            return Err(PipelineError::config("WORKER_CAPACITY must be at least 1"));
        }
        if self.retrieval.max_checks == 0 {
            return Err(PipelineError::config(
                "MAX_RECORDING_CHECKS must be at least 1",
            ));
        }
        if self.tracker.poll_interval.is_zero() {
            return Err(PipelineError::config("CHECK_INTERVAL must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// SiteConfig - Target site URLs and selectors
// ============================================================================

/// Where the feed lives and how to read it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site root; a logged-in page URL starts with this
    pub base_url: String,
    /// Login page
    pub login_url: String,
    /// Page rendering the live feed table
    pub feed_url: String,
    /// Selector for the feed table itself
    pub feed_selector: String,
    /// Selector for candidate rows
    pub row_selector: String,
    /// Substring a row's `id` attribute must contain
    pub row_id_marker: String,
    /// Prefix stripped from the row id to get the correlation uuid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_prefix: Option<String>,
    /// Zero-based cell index holding the endpoint number
    pub endpoint_column: usize,
    /// Rows with fewer cells are ignored
    pub min_cells: usize,
    /// Artifact URL with `{base}`, `{endpoint}` and `{uuid}` placeholders
    pub artifact_url_template: String,
    /// Page function that starts playback, called as `fn(endpoint, uuid)`
    pub playback_function: String,
    /// Optional path (under `base_url`) a page must be on to count as logged in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_login_path_prefix: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            login_url: String::new(),
            feed_url: String::new(),
            feed_selector: "#LiveCalls".to_string(),
            row_selector: "#LiveCalls tr".to_string(),
            row_id_marker: "call_".to_string(),
            correlation_prefix: None,
            endpoint_column: 1,
            min_cells: 5,
            artifact_url_template: "{base}/live/calls/sound?did={endpoint}&uuid={uuid}"
                .to_string(),
            playback_function: "Play".to_string(),
            post_login_path_prefix: None,
        }
    }
}

impl SiteConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        let base_url = env
            .string("BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(d.base_url);
        Self {
            login_url: env
                .string("LOGIN_URL")
                .unwrap_or_else(|| join_url(&base_url, "/login")),
            feed_url: env
                .string("CALL_URL")
                .unwrap_or_else(|| join_url(&base_url, "/live/calls")),
            base_url,
            feed_selector: env.string("FEED_SELECTOR").unwrap_or(d.feed_selector),
            row_selector: env.string("ROW_SELECTOR").unwrap_or(d.row_selector),
            row_id_marker: env.string("ROW_ID_MARKER").unwrap_or(d.row_id_marker),
            correlation_prefix: env.string("CORRELATION_PREFIX"),
            endpoint_column: env.parse("ENDPOINT_COLUMN").unwrap_or(d.endpoint_column),
            min_cells: env.parse("MIN_CELLS").unwrap_or(d.min_cells),
            artifact_url_template: env
                .string("ARTIFACT_URL_TEMPLATE")
                .unwrap_or(d.artifact_url_template),
            playback_function: env
                .string("PLAYBACK_FUNCTION")
                .unwrap_or(d.playback_function),
            post_login_path_prefix: env.string("POST_LOGIN_PATH_PREFIX"),
        }
    }

    /// Set the site root; empty login and feed URLs follow it
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        if self.login_url.is_empty() {
            self.login_url = join_url(&self.base_url, "/login");
        }
        if self.feed_url.is_empty() {
            self.feed_url = join_url(&self.base_url, "/live/calls");
        }
        self
    }

    pub fn with_login_url(mut self, url: impl Into<String>) -> Self {
        self.login_url = url.into();
        self
    }

    pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = url.into();
        self
    }

    pub fn with_correlation_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.correlation_prefix = Some(prefix.into());
        self
    }

    pub fn with_artifact_url_template(mut self, template: impl Into<String>) -> Self {
        self.artifact_url_template = template.into();
        self
    }

    /// Build the artifact URL for one event
    pub fn artifact_url(&self, endpoint: &str, uuid: &str) -> String {
        self.artifact_url_template
            .replace("{base}", &self.base_url)
            .replace("{endpoint}", endpoint)
            .replace("{uuid}", uuid)
    }

    /// Whether `url` is the login page
    pub fn is_login_page(&self, url: &str) -> bool {
        !self.login_url.is_empty() && url.starts_with(&self.login_url)
    }

    /// Whether `url` is a logged-in page of the site
    pub fn is_logged_in_page(&self, url: &str) -> bool {
        if self.is_login_page(url) || !url.starts_with(&self.base_url) {
            return false;
        }
        match &self.post_login_path_prefix {
            Some(prefix) => url.starts_with(&join_url(&self.base_url, prefix)),
            None => true,
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        return String::new();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// ============================================================================
// TrackerConfig - Polling loop cadence and failure ceilings
// ============================================================================

/// Polling loop and lifecycle tracking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Delay between polling cycles
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// An active row unseen for longer than this is complete
    #[serde(with = "duration_millis")]
    pub liveness_window: Duration,
    /// Consecutive snapshots a row must be missing from before it completes
    pub absent_cycles: u32,
    /// Consecutive snapshot failures before a session refresh is forced
    pub snapshot_failure_ceiling: u32,
    /// Consecutive loop errors before the monitor stops
    pub max_consecutive_errors: u32,
    /// Interval between status reports
    #[serde(with = "duration_millis")]
    pub status_report_interval: Duration,
    /// Where diagnostic screenshots go; `None` disables them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_folder: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            liveness_window: Duration::from_secs(20),
            absent_cycles: 1,
            snapshot_failure_ceiling: 3,
            max_consecutive_errors: 10,
            status_report_interval: Duration::from_secs(600),
            screenshot_folder: Some(PathBuf::from("screenshots")),
        }
    }
}

impl TrackerConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            poll_interval: env.secs("CHECK_INTERVAL").unwrap_or(d.poll_interval),
            liveness_window: env.secs("LIVENESS_WINDOW").unwrap_or(d.liveness_window),
            absent_cycles: env
                .parse("ABSENT_CYCLES")
                .unwrap_or(d.absent_cycles)
                .max(1),
            snapshot_failure_ceiling: env
                .parse("SNAPSHOT_FAILURE_CEILING")
                .unwrap_or(d.snapshot_failure_ceiling),
            max_consecutive_errors: env.parse("MAX_ERRORS").unwrap_or(d.max_consecutive_errors),
            status_report_interval: env
                .secs("STATUS_REPORT_INTERVAL")
                .unwrap_or(d.status_report_interval),
            screenshot_folder: match env.string("SCREENSHOT_FOLDER") {
                Some(s) if s.eq_ignore_ascii_case("none") => None,
                Some(s) => Some(PathBuf::from(s)),
                None => d.screenshot_folder,
            },
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    pub fn with_absent_cycles(mut self, cycles: u32) -> Self {
        self.absent_cycles = cycles.max(1);
        self
    }

    pub fn with_snapshot_failure_ceiling(mut self, ceiling: u32) -> Self {
        self.snapshot_failure_ceiling = ceiling;
        self
    }

    pub fn with_screenshot_folder(mut self, folder: Option<PathBuf>) -> Self {
        self.screenshot_folder = folder;
        self
    }
}

// ============================================================================
// RetrievalConfig - Artifact retrieval budget
// ============================================================================

/// Artifact retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Delay between retrieval attempts
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Maximum retrieval attempts per event
    pub max_checks: u32,
    /// Wall-clock budget per event, measured from completion
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
    /// Bodies must be strictly larger than this
    pub min_artifact_bytes: u64,
    /// How long in-session playback is captured before polling for the blob
    #[serde(with = "duration_millis")]
    pub capture_duration: Duration,
    /// Timeout for a single direct fetch
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Whether to try in-session capture before the direct fetch
    pub in_session_capture: bool,
    /// Replace the processing message with an attempt counter on each retry
    pub progress_updates: bool,
    /// Folder transient artifact files are written to
    pub download_folder: PathBuf,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(30),
            max_checks: 20,
            max_wait: Duration::from_secs(600),
            min_artifact_bytes: 1000,
            capture_duration: Duration::from_secs(35),
            request_timeout: Duration::from_secs(30),
            in_session_capture: true,
            progress_updates: false,
            download_folder: PathBuf::from("recordings"),
        }
    }
}

impl RetrievalConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            retry_delay: env.secs("RECORDING_RETRY_DELAY").unwrap_or(d.retry_delay),
            max_checks: env.parse("MAX_RECORDING_CHECKS").unwrap_or(d.max_checks),
            max_wait: env.secs("MAX_RECORDING_WAIT").unwrap_or(d.max_wait),
            min_artifact_bytes: env
                .parse("MIN_RECORDING_BYTES")
                .unwrap_or(d.min_artifact_bytes),
            capture_duration: env.secs("CAPTURE_DURATION").unwrap_or(d.capture_duration),
            request_timeout: env.secs("DOWNLOAD_TIMEOUT").unwrap_or(d.request_timeout),
            in_session_capture: env
                .flag("IN_SESSION_CAPTURE")
                .unwrap_or(d.in_session_capture),
            progress_updates: env.flag("PROGRESS_UPDATES").unwrap_or(d.progress_updates),
            download_folder: env
                .string("DOWNLOAD_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(d.download_folder),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_checks(mut self, max_checks: u32) -> Self {
        self.max_checks = max_checks;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_min_artifact_bytes(mut self, floor: u64) -> Self {
        self.min_artifact_bytes = floor;
        self
    }

    pub fn with_capture_duration(mut self, duration: Duration) -> Self {
        self.capture_duration = duration;
        self
    }

    pub fn with_in_session_capture(mut self, enabled: bool) -> Self {
        self.in_session_capture = enabled;
        self
    }

    pub fn with_progress_updates(mut self, enabled: bool) -> Self {
        self.progress_updates = enabled;
        self
    }

    pub fn with_download_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.download_folder = folder.into();
        self
    }
}

// ============================================================================
// DispatchConfig - Messaging endpoint
// ============================================================================

/// Messaging endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Bot token
    #[serde(default, skip_serializing)]
    pub bot_token: String,
    /// Destination chat
    pub chat_id: String,
    /// Bot API root
    pub api_base: String,
    /// Timeout for text sends
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Timeout for deletes
    #[serde(with = "duration_millis")]
    pub delete_timeout: Duration,
    /// Timeout for attachment uploads
    #[serde(with = "duration_millis")]
    pub upload_timeout: Duration,
    /// Attachments below this size are never uploaded
    pub min_attachment_bytes: u64,
    /// Lifetime of ephemeral status messages
    #[serde(with = "duration_millis")]
    pub ephemeral_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            request_timeout: Duration::from_secs(10),
            delete_timeout: Duration::from_secs(5),
            upload_timeout: Duration::from_secs(60),
            min_attachment_bytes: 1000,
            ephemeral_after: Duration::from_secs(10),
        }
    }
}

impl DispatchConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            bot_token: env.string("BOT_TOKEN").unwrap_or(d.bot_token),
            chat_id: env.string("CHAT_ID").unwrap_or(d.chat_id),
            api_base: env
                .string("TELEGRAM_API_BASE")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.api_base),
            request_timeout: env.secs("TELEGRAM_TIMEOUT").unwrap_or(d.request_timeout),
            delete_timeout: env
                .secs("TELEGRAM_DELETE_TIMEOUT")
                .unwrap_or(d.delete_timeout),
            upload_timeout: env
                .secs("TELEGRAM_UPLOAD_TIMEOUT")
                .unwrap_or(d.upload_timeout),
            min_attachment_bytes: env
                .parse("MIN_ATTACHMENT_BYTES")
                .unwrap_or(d.min_attachment_bytes),
            ephemeral_after: env
                .secs("EPHEMERAL_DELETE_AFTER")
                .unwrap_or(d.ephemeral_after),
        }
    }

    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            ..Default::default()
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_min_attachment_bytes(mut self, floor: u64) -> Self {
        self.min_attachment_bytes = floor;
        self
    }

    pub fn with_ephemeral_after(mut self, after: Duration) -> Self {
        self.ephemeral_after = after;
        self
    }
}

// ============================================================================
// GateConfig - Challenge bypass and manual escalation
// ============================================================================

/// Access Gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Wait after a bypass strategy before re-checking the fingerprint
    #[serde(with = "duration_millis")]
    pub settle_delay: Duration,
    /// Time box for a single bypass strategy
    #[serde(with = "duration_millis")]
    pub strategy_timeout: Duration,
    /// Interval between clearance checks during manual escalation
    #[serde(with = "duration_millis")]
    pub manual_poll_interval: Duration,
    /// Manual escalation ceiling while logging in
    #[serde(with = "duration_millis")]
    pub login_ceiling: Duration,
    /// Manual escalation ceiling during steady-state operation
    #[serde(with = "duration_millis")]
    pub steady_ceiling: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            strategy_timeout: Duration::from_secs(15),
            manual_poll_interval: Duration::from_secs(30),
            login_ceiling: Duration::from_secs(1800),
            steady_ceiling: Duration::from_secs(120),
        }
    }
}

impl GateConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            settle_delay: env.secs("CAPTCHA_SETTLE_DELAY").unwrap_or(d.settle_delay),
            strategy_timeout: env
                .secs("CAPTCHA_STRATEGY_TIMEOUT")
                .unwrap_or(d.strategy_timeout),
            manual_poll_interval: env
                .secs("MANUAL_POLL_INTERVAL")
                .unwrap_or(d.manual_poll_interval),
            login_ceiling: env.secs("MANUAL_LOGIN_TIMEOUT").unwrap_or(d.login_ceiling),
            steady_ceiling: env
                .secs("MANUAL_CAPTCHA_TIMEOUT")
                .unwrap_or(d.steady_ceiling),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_manual_poll_interval(mut self, interval: Duration) -> Self {
        self.manual_poll_interval = interval;
        self
    }

    pub fn with_ceilings(mut self, login: Duration, steady: Duration) -> Self {
        self.login_ceiling = login;
        self.steady_ceiling = steady;
        self
    }
}

// ============================================================================
// RefreshConfig - Rotating session refresh
// ============================================================================

/// Refresh Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub enabled: bool,
    /// Delays cycled through between refreshes
    #[serde(with = "duration_millis_vec")]
    pub intervals: Vec<Duration>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            intervals: [300, 370, 200, 330, 280]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

impl RefreshConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        let intervals = env
            .string("REFRESH_INTERVALS")
            .map(|s| {
                s.split(',')
                    .filter_map(|part| part.trim().parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(d.intervals);
        Self {
            enabled: env.flag("REFRESH_ENABLED").unwrap_or(d.enabled),
            intervals,
        }
    }

    pub fn with_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

// ============================================================================
// PoolConfig - Worker pool sizing
// ============================================================================

/// Concurrency Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent workers
    pub capacity: usize,
    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            capacity: env.parse("WORKER_CAPACITY").unwrap_or(d.capacity),
            shutdown_timeout: env.secs("SHUTDOWN_TIMEOUT").unwrap_or(d.shutdown_timeout),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ============================================================================
// WebDriverConfig - Browser automation endpoint
// ============================================================================

/// WebDriver endpoint and browser settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDriverConfig {
    /// WebDriver server root (chromedriver, geckodriver, selenium)
    pub endpoint: String,
    /// `browserName` capability
    pub browser_name: String,
    /// Extra browser command-line arguments
    pub args: Vec<String>,
    /// User agent override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Run without a visible window (manual solving needs one)
    pub headless: bool,
    /// Timeout for a single WebDriver command
    #[serde(with = "duration_millis")]
    pub command_timeout: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            browser_name: "chrome".to_string(),
            args: vec![
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-blink-features=AutomationControlled".to_string(),
                "--window-size=1920,1080".to_string(),
            ],
            user_agent: None,
            headless: false,
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl WebDriverConfig {
    fn from_env_with(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            endpoint: env
                .string("WEBDRIVER_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.endpoint),
            browser_name: env.string("BROWSER_NAME").unwrap_or(d.browser_name),
            args: env
                .string("BROWSER_ARGS")
                .map(|s| {
                    s.split(',')
                        .map(|a| a.trim().to_string())
                        .filter(|a| !a.is_empty())
                        .collect()
                })
                .unwrap_or(d.args),
            user_agent: env.string("BROWSER_USER_AGENT"),
            headless: env.flag("HEADLESS").unwrap_or(d.headless),
            command_timeout: env
                .secs("WEBDRIVER_TIMEOUT")
                .unwrap_or(d.command_timeout),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }
}

// ============================================================================
// Environment lookup helpers
// ============================================================================

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparsable config value");
                None
            }
        }
    }

    fn secs(&self, key: &str) -> Option<Duration> {
        self.parse::<u64>(key).map(Duration::from_secs)
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.string(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}

/// Serde support for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_millis_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        durations
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}
