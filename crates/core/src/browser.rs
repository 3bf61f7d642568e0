// Controlled browsing session abstraction
//
// The pipeline needs a handful of primitives from the browser: navigate, read
// page markup, execute a script, read/set cookies, take a screenshot. Nothing
// here knows about a specific site; selectors are passed in by the caller.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::session::BrowserCookie;

// ============================================================================
// BrowserSession - The single shared browsing session
// ============================================================================

/// Trait for the controlled browsing session
///
/// Only the polling loop and the Access Gate navigate it. Workers only run
/// capture scripts on the current page, under `SharedBrowser::lock_within`.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate to `url` and wait for the page to load
    async fn navigate(&self, url: &str) -> Result<()>;

    /// URL of the current page
    async fn current_url(&self) -> Result<String>;

    /// Title of the current page
    async fn title(&self) -> Result<String>;

    /// Full markup of the current page
    async fn page_source(&self) -> Result<String>;

    /// Outer markup of every element matching a CSS selector
    async fn page_markup(&self, selector: &str) -> Result<Vec<String>>;

    /// Execute a script synchronously and return its value
    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value>;

    /// Cookies visible to the current page
    async fn cookies(&self) -> Result<Vec<BrowserCookie>>;

    /// Add a cookie to the current page's domain
    async fn set_cookie(&self, cookie: BrowserCookie) -> Result<()>;

    /// PNG screenshot of the viewport
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// User agent the browser presents
    async fn user_agent(&self) -> Result<Option<String>> {
        let value = self
            .execute_script("return navigator.userAgent;", vec![])
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    /// Whether at least one element matches `selector`
    async fn exists(&self, selector: &str) -> Result<bool> {
        Ok(!self.page_markup(selector).await?.is_empty())
    }
}

// ============================================================================
// SharedBrowser - Serialized access to the one session
// ============================================================================

/// Handle to the browsing session that serializes every use of it
///
/// Each component holds the lock only for the duration of one operation,
/// never across a call into another component that also locks.
#[derive(Clone)]
pub struct SharedBrowser {
    session: Arc<dyn BrowserSession>,
    lock: Arc<Mutex<()>>,
}

impl SharedBrowser {
    pub fn new(session: Arc<dyn BrowserSession>) -> Self {
        Self {
            session,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for exclusive use of the session
    pub async fn lock(&self) -> BrowserGuard<'_> {
        let guard = self.lock.lock().await;
        BrowserGuard {
            session: self.session.as_ref(),
            _guard: guard,
        }
    }

    /// Wait up to `wait` for exclusive use of the session
    pub async fn lock_within(&self, wait: Duration) -> Option<BrowserGuard<'_>> {
        let guard = tokio::time::timeout(wait, self.lock.lock()).await.ok()?;
        Some(BrowserGuard {
            session: self.session.as_ref(),
            _guard: guard,
        })
    }
}

impl std::fmt::Debug for SharedBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBrowser").finish_non_exhaustive()
    }
}

/// Exclusive use of the session, released on drop
pub struct BrowserGuard<'a> {
    session: &'a (dyn BrowserSession + 'static),
    _guard: MutexGuard<'a, ()>,
}

impl Deref for BrowserGuard<'_> {
    type Target = dyn BrowserSession + 'static;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}
