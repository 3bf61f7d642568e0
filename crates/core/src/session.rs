// Session domain types
//
// `Session` is the Access Gate's view of the single controlled browsing
// session. Other components only see `SessionAccess` (the capability answer)
// and `SessionSnapshot` (cookies and user agent copied out at hand-off).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of the controlled browsing session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    /// Whether the last access check left the session usable
    pub usable: bool,
    /// When the session was last (re)established
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<DateTime<Utc>>,
    /// Fingerprint name of the challenge currently blocking the page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_type: Option<String>,
}

impl Session {
    pub fn mark_usable(&mut self, now: DateTime<Utc>) {
        self.usable = true;
        self.last_refresh_at = Some(now);
        self.challenge_type = None;
    }

    pub fn mark_challenged(&mut self, challenge: impl Into<String>) {
        self.usable = false;
        self.challenge_type = Some(challenge.into());
    }

    pub fn mark_blocked(&mut self) {
        self.usable = false;
    }
}

/// Answer to "ensure a usable session at this URL"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAccess {
    /// Downstream components may proceed
    Usable,
    /// Callers must not read the feed and should retry after a backoff
    Blocked,
}

impl SessionAccess {
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionAccess::Usable)
    }
}

/// A cookie as exposed by the browsing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl BrowserCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
        }
    }
}

/// Credentials copied out of the browsing session for an independent HTTP client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub cookies: Vec<BrowserCookie>,
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn new(cookies: Vec<BrowserCookie>, user_agent: Option<String>) -> Self {
        Self {
            cookies,
            user_agent,
            taken_at: Some(Utc::now()),
        }
    }

    /// Render the cookies as a `Cookie` request header value
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
