// Challenge fingerprints
//
// A page is challenged when its URL, title or markup contains a known
// interstitial indicator, or when one of the known challenge selectors
// matches an element.

use callrelay_core::{BrowserSession, Result};
use serde::{Deserialize, Serialize};

/// Which page signal matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeSignal {
    Url,
    Title,
    Text,
    Selector,
}

/// A detected challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeMatch {
    /// Challenge family (cloudflare, recaptcha, hcaptcha, generic)
    pub kind: String,
    /// Signal that matched
    pub signal: ChallengeSignal,
    /// Indicator or selector that matched
    pub indicator: String,
}

impl ChallengeMatch {
    fn new(signal: ChallengeSignal, indicator: &str) -> Self {
        Self {
            kind: classify(indicator).to_string(),
            signal,
            indicator: indicator.to_string(),
        }
    }
}

fn classify(indicator: &str) -> &'static str {
    let lower = indicator.to_lowercase();
    if lower.contains("hcaptcha") {
        "hcaptcha"
    } else if lower.contains("recaptcha") {
        "recaptcha"
    } else if lower.contains("cloudflare")
        || lower.contains("cf-")
        || lower.contains("cf_chl")
        || lower.contains("challenge")
        || lower.contains("just a moment")
        || lower.contains("checking your browser")
        || lower.contains("attention required")
    {
        "cloudflare"
    } else {
        "generic"
    }
}

/// Fixed list of challenge indicators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeFingerprints {
    pub url_markers: Vec<String>,
    pub title_markers: Vec<String>,
    pub text_markers: Vec<String>,
    pub selectors: Vec<String>,
}

impl Default for ChallengeFingerprints {
    fn default() -> Self {
        let strings =
            |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            url_markers: strings(&["/cdn-cgi/challenge-platform", "__cf_chl", "/captcha"]),
            title_markers: strings(&[
                "Just a moment",
                "Attention Required",
                "Security check",
                "Verifying you are human",
            ]),
            // Captcha vendors are matched by widget selectors only; login
            // pages load their scripts without showing a challenge
            text_markers: strings(&[
                "challenges.cloudflare.com",
                "cf-challenge",
                "Just a moment",
                "Checking your browser",
                "Verifying you are human",
                "Security check",
            ]),
            selectors: strings(&[
                ".cf-captcha",
                ".captcha",
                ".hcaptcha",
                ".h-captcha",
                ".g-recaptcha",
                "[data-sitekey]",
                "iframe[src*='captcha']",
                "iframe[src*='challenge']",
            ]),
        }
    }
}

impl ChallengeFingerprints {
    /// Match URL, title and markup against the indicator lists
    pub fn match_page(&self, url: &str, title: &str, source: &str) -> Option<ChallengeMatch> {
        let url_lower = url.to_lowercase();
        if let Some(m) = first_contained(&self.url_markers, &url_lower) {
            return Some(ChallengeMatch::new(ChallengeSignal::Url, m));
        }
        let title_lower = title.to_lowercase();
        if let Some(m) = first_contained(&self.title_markers, &title_lower) {
            return Some(ChallengeMatch::new(ChallengeSignal::Title, m));
        }
        let source_lower = source.to_lowercase();
        first_contained(&self.text_markers, &source_lower)
            .map(|m| ChallengeMatch::new(ChallengeSignal::Text, m))
    }

    /// Inspect the current page. Browser errors propagate; a page that
    /// cannot be read is not known to be clear.
    pub async fn detect(&self, browser: &dyn BrowserSession) -> Result<Option<ChallengeMatch>> {
        let url = browser.current_url().await?;
        let title = browser.title().await?;
        let source = browser.page_source().await?;
        if let Some(m) = self.match_page(&url, &title, &source) {
            return Ok(Some(m));
        }
        for selector in &self.selectors {
            if browser.exists(selector).await? {
                return Ok(Some(ChallengeMatch::new(ChallengeSignal::Selector, selector)));
            }
        }
        Ok(None)
    }
}

fn first_contained<'a>(markers: &'a [String], haystack_lower: &str) -> Option<&'a str> {
    markers
        .iter()
        .find(|m| haystack_lower.contains(&m.to_lowercase()))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use callrelay_core::memory::{ScriptedBrowser, ScriptedChallenge};

    #[test]
    fn test_match_title() {
        let fp = ChallengeFingerprints::default();
        let m = fp
            .match_page("https://feed.test/live", "Just a moment...", "<html></html>")
            .unwrap();
        assert_eq!(m.signal, ChallengeSignal::Title);
        assert_eq!(m.kind, "cloudflare");
    }

    #[test]
    fn test_match_text_is_case_insensitive() {
        let fp = ChallengeFingerprints::default();
        let m = fp
            .match_page("https://feed.test", "Live", "<div>CHECKING YOUR BROWSER</div>")
            .unwrap();
        assert_eq!(m.signal, ChallengeSignal::Text);
    }

    #[test]
    fn test_captcha_script_alone_is_not_a_challenge() {
        let fp = ChallengeFingerprints::default();
        let login = "<form id=\"login\"><input name=\"user\"></form>\
            <script src=\"https://www.google.com/recaptcha/api.js\"></script>\
            <script src=\"https://hcaptcha.com/1/api.js\"></script>";
        assert!(fp.match_page("https://feed.test/login", "Login", login).is_none());
    }

    #[tokio::test]
    async fn test_login_page_with_captcha_script_is_clear() {
        let fp = ChallengeFingerprints::default();
        let browser = ScriptedBrowser::new()
            .at_url("https://feed.test/login")
            .with_title("Login")
            .with_source("<script src=\"https://www.google.com/recaptcha/api.js\"></script>");
        assert!(fp.detect(&browser).await.unwrap().is_none());
    }

    #[test]
    fn test_match_url() {
        let fp = ChallengeFingerprints::default();
        let m = fp
            .match_page("https://feed.test/?__cf_chl_rt_tk=abc", "", "")
            .unwrap();
        assert_eq!(m.signal, ChallengeSignal::Url);
    }

    #[test]
    fn test_clean_page() {
        let fp = ChallengeFingerprints::default();
        assert!(fp
            .match_page("https://feed.test/live/calls", "Live Calls", "<table id=\"LiveCalls\"></table>")
            .is_none());
    }

    #[tokio::test]
    async fn test_detect_by_selector() {
        let fp = ChallengeFingerprints::default();
        let browser = ScriptedBrowser::new()
            .at_url("https://feed.test/login")
            .with_title("Login")
            .with_markup(".g-recaptcha", vec!["<div class=\"g-recaptcha\"></div>".to_string()]);

        let m = fp.detect(&browser).await.unwrap().unwrap();
        assert_eq!(m.signal, ChallengeSignal::Selector);
        assert_eq!(m.kind, "recaptcha");
    }

    #[tokio::test]
    async fn test_detect_scripted_challenge() {
        let fp = ChallengeFingerprints::default();
        let browser = ScriptedBrowser::new().with_challenge(ScriptedChallenge::cloudflare());
        assert!(fp.detect(&browser).await.unwrap().is_some());

        browser.set_challenge(None);
        assert!(fp.detect(&browser).await.unwrap().is_none());
    }
}
