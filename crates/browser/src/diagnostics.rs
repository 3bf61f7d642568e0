// Diagnostic screenshots
//
// Best effort only: a failed screenshot is logged and never interrupts the
// caller.

use std::path::PathBuf;

use callrelay_core::BrowserSession;
use chrono::Utc;
use tracing::{debug, warn};

/// Writes timestamped screenshots into a folder
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    folder: Option<PathBuf>,
}

impl Diagnostics {
    pub fn new(folder: Option<PathBuf>) -> Self {
        Self { folder }
    }

    pub fn disabled() -> Self {
        Self { folder: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.folder.is_some()
    }

    /// Capture the viewport as `<label>_<timestamp>.png`
    pub async fn screenshot(&self, browser: &dyn BrowserSession, label: &str) -> Option<PathBuf> {
        let folder = self.folder.as_ref()?;

        let png = match browser.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!(%label, error = %e, "Screenshot failed");
                return None;
            }
        };

        let name = format!(
            "{}_{}.png",
            sanitize(label),
            Utc::now().format("%Y%m%d_%H%M%S%.3f")
        );
        let path = folder.join(name);

        if let Err(e) = tokio::fs::create_dir_all(folder).await {
            warn!(folder = %folder.display(), error = %e, "Cannot create screenshot folder");
            return None;
        }
        if let Err(e) = tokio::fs::write(&path, png).await {
            warn!(path = %path.display(), error = %e, "Cannot write screenshot");
            return None;
        }

        debug!(path = %path.display(), "Screenshot saved");
        Some(path)
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use callrelay_core::memory::ScriptedBrowser;

    #[tokio::test]
    async fn test_disabled_takes_nothing() {
        let browser = ScriptedBrowser::new();
        assert!(Diagnostics::disabled()
            .screenshot(&browser, "snapshot")
            .await
            .is_none());
        assert_eq!(browser.screenshot_count(), 0);
    }

    #[tokio::test]
    async fn test_writes_png() {
        let folder = std::env::temp_dir().join(format!("callrelay-shots-{}", uuid::Uuid::now_v7()));
        let browser = ScriptedBrowser::new();
        let path = Diagnostics::new(Some(folder.clone()))
            .screenshot(&browser, "challenge/escalation")
            .await
            .unwrap();

        assert!(path.starts_with(&folder));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("challenge_escalation_"));
        assert!(tokio::fs::read(&path).await.unwrap().starts_with(b"\x89PNG"));

        let _ = tokio::fs::remove_dir_all(&folder).await;
    }
}
