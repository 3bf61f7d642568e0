// Message formatting
//
// Every user-visible message is built here so wording stays consistent.
// Messages are HTML (the bot endpoint sends with parse_mode=HTML).

use std::time::Duration;

use chrono::{DateTime, Local, Utc};

use crate::event::Event;
use crate::region::Region;

const TIME_FORMAT: &str = "%Y-%m-%d %I:%M:%S %p";

/// Keep only ASCII digits
pub fn normalize_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Mask an endpoint for display: more than 6 digits keeps the first 4 and
/// last 3 with `****` between, anything shorter is shown as-is
pub fn mask_number(raw: &str) -> String {
    let digits = normalize_digits(raw);
    if digits.len() > 6 {
        format!("{}****{}", &digits[..4], &digits[digits.len() - 3..])
    } else {
        digits
    }
}

/// Escape text for HTML parse mode
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

fn subject_lines(event: &Event, region: &Region) -> String {
    format!(
        "📞 <b>Number:</b> {} {}\n🌍 <b>Country:</b> {}",
        region.flag,
        mask_number(&event.endpoint),
        escape_html(&region.name)
    )
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

// ============================================================================
// Event messages
// ============================================================================

pub fn detected(event: &Event, region: &Region) -> String {
    format!(
        "📞 <b>New Call Detected</b>\n\n📍 <b>From:</b> {} {}\n🌍 <b>Country:</b> {}\n⏰ <b>Time:</b> {}\n\n🔄 Waiting for call to end...",
        region.flag,
        mask_number(&event.endpoint),
        escape_html(&region.name),
        local_time(event.detected_at)
    )
}

pub fn processing(event: &Event, region: &Region) -> String {
    format!(
        "🎯 <b>Call Processing</b>\n\n{}\n\n⏳ Downloading recording...",
        subject_lines(event, region)
    )
}

pub fn attempt_progress(event: &Event, region: &Region, attempt: u32, max_checks: u32) -> String {
    format!(
        "🔄 <b>Processing Recording</b>\n\n{}\n\n📊 <b>Attempt:</b> {}/{}",
        subject_lines(event, region),
        attempt,
        max_checks
    )
}

pub fn delivered_caption(event: &Event, region: &Region) -> String {
    format!(
        "🔥 <b>NEW CALL RECEIVED</b>\n\n⏰ <b>Time:</b> {}\n🌍 <b>Country:</b> {} {}\n📞 <b>Number:</b> {}\n\n🛡️ <b>Status:</b> Successfully Recorded",
        local_time(event.detected_at),
        escape_html(&region.name),
        region.flag,
        mask_number(&event.endpoint)
    )
}

pub fn retrieval_timed_out(event: &Event, region: &Region) -> String {
    format!(
        "❌ <b>Recording Timeout</b>\n\n{}\n\n💡 Recording not available after {} attempts",
        subject_lines(event, region),
        event.check_count
    )
}

pub fn retrieval_failed(event: &Event, region: &Region, reason: &str) -> String {
    format!(
        "❌ <b>Recording Failed</b>\n\n{}\n\n💡 {}",
        subject_lines(event, region),
        escape_html(reason)
    )
}

/// Caption re-sent as text when an attachment upload fails
pub fn upload_fallback(caption: &str) -> String {
    format!("{}\n\n⚠️ Recording upload failed", caption)
}

// ============================================================================
// Access messages
// ============================================================================

pub fn challenge_escalation(url: &str, challenge: &str, ceiling: Duration) -> String {
    format!(
        "🚨 <b>CAPTCHA Detected - Manual Action Needed</b>\n\n🔗 <b>Page:</b> {}\n🛡️ <b>Type:</b> {}\n\n⏳ Automatic bypass failed. Please solve it manually within {}.",
        escape_html(url),
        escape_html(challenge),
        human_duration(ceiling)
    )
}

pub fn manual_timeout(url: &str, waited: Duration) -> String {
    format!(
        "⏰ <b>CAPTCHA Timeout</b>\n\n🔗 <b>Page:</b> {}\n\n❌ Not solved after {}. Monitoring will retry.",
        escape_html(url),
        human_duration(waited)
    )
}

pub fn challenge_cleared(url: &str) -> String {
    format!(
        "✅ <b>CAPTCHA Solved</b>\n\n🔗 <b>Page:</b> {}\n\n🎯 <b>Status:</b> Proceeding to next step",
        escape_html(url)
    )
}

pub fn login_required(url: &str, ceiling: Duration) -> String {
    format!(
        "🔐 <b>Login Required</b>\n\n🔗 <b>Page:</b> {}\n\n⏳ Waiting up to {} for manual login...",
        escape_html(url),
        human_duration(ceiling)
    )
}

pub fn login_succeeded() -> String {
    "✅ <b>Login Successful</b>\n\n🔐 <b>Status:</b> Successfully authenticated".to_string()
}

pub fn login_timed_out(waited: Duration) -> String {
    format!(
        "❌ <b>Login Timeout</b>\n\n🔐 <b>Status:</b> Manual login not completed after {}",
        human_duration(waited)
    )
}

pub fn session_expired() -> String {
    "⚠️ <b>Session Expired</b>\n\n📋 <b>Status:</b> Re-authentication required".to_string()
}

// ============================================================================
// Refresh and lifecycle messages
// ============================================================================

pub fn refresh_pausing() -> String {
    "⏸️ <b>Refreshing session</b>, monitoring paused briefly...".to_string()
}

pub fn refresh_resumed() -> String {
    "▶️ <b>Monitoring resumed</b>".to_string()
}

pub fn monitor_started(now: DateTime<Utc>) -> String {
    format!(
        "🤖 <b>Call Monitor Started</b>\n\n⏰ <b>Time:</b> {}\n🛡️ <b>CAPTCHA Bypass:</b> Enabled\n✅ <b>Status:</b> Monitoring calls...",
        local_time(now)
    )
}

pub fn monitor_stopped(reason: &str) -> String {
    format!(
        "🛑 <b>Monitoring Stopped</b>\n\n📋 <b>Reason:</b> {}",
        escape_html(reason)
    )
}

pub fn status_report(active: usize, in_flight: usize, uptime: Duration, now: DateTime<Utc>) -> String {
    format!(
        "📊 <b>System Status Report</b>\n\n⏰ <b>Time:</b> {}\n⏱️ <b>Uptime:</b> {}\n📞 <b>Active calls:</b> {}\n🎵 <b>Recordings in progress:</b> {}",
        local_time(now),
        human_duration(uptime),
        active,
        in_flight
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FeedRow;

    fn event() -> Event {
        Event::detect(FeedRow::new("call_1", "15551234567"), None, Utc::now())
    }

    #[test]
    fn test_mask_number() {
        assert_eq!(mask_number("15551234567"), "1555****567");
        assert_eq!(mask_number("+1 555 123 4567"), "1555****567");
        assert_eq!(mask_number("1234567"), "1234****567");
        assert_eq!(mask_number("123456"), "123456");
        assert_eq!(mask_number(""), "");
    }

    #[test]
    fn test_normalize_digits() {
        assert_eq!(normalize_digits(" +44 (20) 7946-0018 "), "442079460018");
    }

    #[test]
    fn test_messages_mask_endpoint() {
        let region = Region::new("United States", "🇺🇸");
        let event = event();
        for text in [
            detected(&event, &region),
            processing(&event, &region),
            delivered_caption(&event, &region),
            retrieval_timed_out(&event, &region),
        ] {
            assert!(text.contains("1555****567"), "{}", text);
            assert!(!text.contains("15551234567"), "{}", text);
        }
    }

    #[test]
    fn test_escape_region_name() {
        let region = Region::new("Trinidad & Tobago", "🇹🇹");
        assert!(processing(&event(), &region).contains("Trinidad &amp; Tobago"));
    }

    #[test]
    fn test_upload_fallback_keeps_caption() {
        let caption = delivered_caption(&event(), &Region::unknown());
        assert!(upload_fallback(&caption).starts_with(&caption));
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::from_secs(45)), "45s");
        assert_eq!(human_duration(Duration::from_secs(120)), "2m 0s");
        assert_eq!(human_duration(Duration::from_secs(1800)), "30m 0s");
        assert_eq!(human_duration(Duration::from_secs(3720)), "1h 2m");
    }
}
