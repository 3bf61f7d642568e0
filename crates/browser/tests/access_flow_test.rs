// Integration tests for the Access Gate and Feed Snapshotter sharing one
// browser session
//
// Run with: cargo test -p callrelay-browser --test access_flow_test

use std::sync::Arc;
use std::time::Duration;

use callrelay_browser::{AccessGate, AccessMode, FeedSnapshotter};
use callrelay_core::memory::{RecordingNotifier, ScriptedBrowser, ScriptedChallenge};
use callrelay_core::{FeedRow, GateConfig, PipelineError, SessionAccess, SharedBrowser, SiteConfig};

fn feed_row(id: &str, number: &str) -> String {
    format!(
        "<tr id=\"{}\"><td>1</td><td>{}</td><td>CLI</td><td>00:03</td><td>play</td></tr>",
        id, number
    )
}

/// Shared browser showing the live feed with the given rows
fn feed_browser(site: &SiteConfig, rows: Vec<String>) -> ScriptedBrowser {
    ScriptedBrowser::new()
        .with_title("Live Calls")
        .with_markup(&site.feed_selector, vec!["<table id=\"LiveCalls\"></table>".to_string()])
        .with_markup(&site.row_selector, rows)
}

#[tokio::test]
async fn test_gate_then_snapshot() {
    let site = SiteConfig::default().with_base_url("https://feed.test");
    let browser = feed_browser(&site, vec![feed_row("call_1", "+44 20 7946 0001")]);
    let shared = SharedBrowser::new(Arc::new(browser.clone()));
    let notifier = RecordingNotifier::new();

    let gate = AccessGate::new(shared.clone(), Arc::new(notifier.clone()), GateConfig::default());
    let snapshotter = FeedSnapshotter::new(shared, &site).unwrap();

    assert_eq!(
        gate.ensure_session(&site.feed_url, AccessMode::SteadyState).await,
        SessionAccess::Usable
    );
    assert!(snapshotter.locate_feed().await);
    assert_eq!(
        snapshotter.snapshot().await.unwrap(),
        vec![FeedRow::new("call_1", "442079460001")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_challenge_mid_session_hides_feed_until_solved() {
    let site = SiteConfig::default().with_base_url("https://feed.test");
    let browser = feed_browser(&site, vec![feed_row("call_1", "5551234567")]);
    let shared = SharedBrowser::new(Arc::new(browser.clone()));
    let notifier = RecordingNotifier::new();

    let gate = AccessGate::new(shared.clone(), Arc::new(notifier.clone()), GateConfig::default());
    let snapshotter = FeedSnapshotter::new(shared, &site).unwrap();

    browser.set_challenge(Some(
        ScriptedChallenge::cloudflare().clears_after(Duration::from_secs(70)),
    ));

    // The interstitial replaces the feed table
    assert!(matches!(
        snapshotter.snapshot().await,
        Err(PipelineError::SnapshotRead(_))
    ));

    assert_eq!(gate.check_current(AccessMode::SteadyState).await, SessionAccess::Usable);
    assert_eq!(notifier.count_containing("CAPTCHA Detected"), 1);
    assert_eq!(notifier.count_containing("CAPTCHA Solved"), 1);
    assert_eq!(snapshotter.snapshot().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_gate_leaves_session_unusable() {
    let site = SiteConfig::default().with_base_url("https://feed.test");
    let browser = feed_browser(&site, vec![]).with_challenge(ScriptedChallenge::cloudflare());
    let shared = SharedBrowser::new(Arc::new(browser.clone()));
    let notifier = RecordingNotifier::new();

    let config = GateConfig::default()
        .with_manual_poll_interval(Duration::from_secs(10))
        .with_ceilings(Duration::from_secs(60), Duration::from_secs(30));
    let gate = AccessGate::new(shared, Arc::new(notifier.clone()), config);

    assert_eq!(
        gate.ensure_session(&site.feed_url, AccessMode::SteadyState).await,
        SessionAccess::Blocked
    );
    assert!(!gate.is_usable());
    assert_eq!(notifier.count_containing("CAPTCHA Detected"), 1);
    assert_eq!(notifier.count_containing("CAPTCHA Timeout"), 1);
}
