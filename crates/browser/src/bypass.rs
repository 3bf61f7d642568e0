// Challenge bypass strategies
//
// Each strategy looks for something to interact with and reports whether it
// acted. Whether the action worked is decided by the gate, which re-checks
// the fingerprints after a settle delay.

use std::time::Duration;

use async_trait::async_trait;
use callrelay_core::{BrowserSession, Result};
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

use crate::challenge::ChallengeMatch;

// ============================================================================
// BypassStrategy - One way of clearing a challenge
// ============================================================================

/// Trait for challenge bypass strategies
#[async_trait]
pub trait BypassStrategy: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Interact with the challenge. Returns whether anything was found to
    /// interact with.
    async fn attempt(&self, browser: &dyn BrowserSession, challenge: &ChallengeMatch)
        -> Result<bool>;
}

/// The three built-in strategies in the order they are tried
pub fn default_strategies() -> Vec<Box<dyn BypassStrategy>> {
    vec![
        Box::new(WidgetInteraction::default()),
        Box::new(FormSubmit),
        Box::new(GenericElement),
    ]
}

fn acted(value: Value) -> bool {
    value.as_bool().unwrap_or(false)
}

// ============================================================================
// WidgetInteraction - Embedded challenge widget with human-like pointer
// ============================================================================

const LOCATE_WIDGET_SCRIPT: &str = r#"
var selectors = ["iframe[src*='challenge']", "iframe[src*='captcha']", "iframe[title*='challenge']",
                 ".cf-turnstile", ".g-recaptcha", ".h-captcha", "[data-sitekey]"];
for (var i = 0; i < selectors.length; i++) {
    var el = document.querySelector(selectors[i]);
    if (!el) continue;
    var r = el.getBoundingClientRect();
    if (r.width < 1 || r.height < 1) continue;
    return { x: r.left + Math.min(30, r.width / 2), y: r.top + r.height / 2,
             vw: window.innerWidth, vh: window.innerHeight };
}
return null;
"#;

const POINTER_MOVE_SCRIPT: &str = r#"
var x = arguments[0], y = arguments[1];
var target = document.elementFromPoint(x, y) || document.body;
target.dispatchEvent(new MouseEvent('mousemove', { clientX: x, clientY: y, bubbles: true }));
return true;
"#;

const POINTER_CLICK_SCRIPT: &str = r#"
var x = arguments[0], y = arguments[1];
var target = document.elementFromPoint(x, y);
if (!target) return false;
['mousedown', 'mouseup', 'click'].forEach(function (type) {
    target.dispatchEvent(new MouseEvent(type, { clientX: x, clientY: y, bubbles: true }));
});
if (target.tagName === 'IFRAME') {
    try {
        var box = target.contentDocument.querySelector("input[type='checkbox'], .ctp-checkbox-label, #checkbox");
        if (box) box.click();
    } catch (e) {}
}
return true;
"#;

/// One pointer movement followed by a pause
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerStep {
    pub x: f64,
    pub y: f64,
    pub pause: Duration,
}

/// Moves the pointer toward the embedded widget along a jittered path,
/// dwells, then clicks
#[derive(Debug, Clone)]
pub struct WidgetInteraction {
    /// Number of intermediate pointer moves
    pub steps: usize,
    /// Pause range between moves, in milliseconds
    pub move_pause_ms: (u64, u64),
    /// Dwell range before the click, in milliseconds
    pub dwell_ms: (u64, u64),
}

impl Default for WidgetInteraction {
    fn default() -> Self {
        Self {
            steps: 12,
            move_pause_ms: (15, 60),
            dwell_ms: (300, 900),
        }
    }
}

impl WidgetInteraction {
    /// Eased path from `from` to `to` with a few pixels of jitter on every
    /// point but the last
    pub fn pointer_path<R: Rng>(&self, from: (f64, f64), to: (f64, f64), rng: &mut R) -> Vec<PointerStep> {
        let steps = self.steps.max(1);
        (1..=steps)
            .map(|i| {
                let t = i as f64 / steps as f64;
                let eased = t * t * (3.0 - 2.0 * t);
                let (jx, jy) = if i == steps {
                    (0.0, 0.0)
                } else {
                    (rng.gen_range(-3.0..3.0), rng.gen_range(-3.0..3.0))
                };
                PointerStep {
                    x: from.0 + (to.0 - from.0) * eased + jx,
                    y: from.1 + (to.1 - from.1) * eased + jy,
                    pause: Duration::from_millis(
                        rng.gen_range(self.move_pause_ms.0..=self.move_pause_ms.1),
                    ),
                }
            })
            .collect()
    }

    fn plan(&self, target: (f64, f64), viewport: (f64, f64)) -> (Vec<PointerStep>, Duration) {
        let mut rng = rand::thread_rng();
        let from = (
            rng.gen_range(0.0..viewport.0.max(1.0)),
            rng.gen_range(0.0..viewport.1.max(1.0)),
        );
        let path = self.pointer_path(from, target, &mut rng);
        let dwell = Duration::from_millis(rng.gen_range(self.dwell_ms.0..=self.dwell_ms.1));
        (path, dwell)
    }
}

#[async_trait]
impl BypassStrategy for WidgetInteraction {
    fn name(&self) -> &'static str {
        "widget"
    }

    async fn attempt(&self, browser: &dyn BrowserSession, challenge: &ChallengeMatch) -> Result<bool> {
        let located = browser.execute_script(LOCATE_WIDGET_SCRIPT, vec![]).await?;
        let (Some(x), Some(y)) = (located["x"].as_f64(), located["y"].as_f64()) else {
            debug!(kind = %challenge.kind, "No challenge widget on page");
            return Ok(false);
        };
        let viewport = (
            located["vw"].as_f64().unwrap_or(1280.0),
            located["vh"].as_f64().unwrap_or(800.0),
        );

        let (path, dwell) = self.plan((x, y), viewport);
        for step in path {
            browser
                .execute_script(POINTER_MOVE_SCRIPT, vec![json!(step.x), json!(step.y)])
                .await?;
            tokio::time::sleep(step.pause).await;
        }
        tokio::time::sleep(dwell).await;

        let clicked = browser
            .execute_script(POINTER_CLICK_SCRIPT, vec![json!(x), json!(y)])
            .await?;
        Ok(acted(clicked))
    }
}

// ============================================================================
// FormSubmit - Submit the challenge form
// ============================================================================

const FORM_SUBMIT_SCRIPT: &str = r#"
var forms = Array.from(document.querySelectorAll(
    "form#challenge-form, form.challenge-form, form[action*='challenge'], form[action*='captcha']"));
if (!forms.length) {
    forms = Array.from(document.forms).filter(function (f) { return /captcha|challenge/i.test(f.innerHTML); });
}
if (!forms.length) return false;
var form = forms[0];
if (typeof form.requestSubmit === 'function') { form.requestSubmit(); } else { form.submit(); }
return true;
"#;

/// Submits the first challenge form on the page
#[derive(Debug, Clone, Copy, Default)]
pub struct FormSubmit;

#[async_trait]
impl BypassStrategy for FormSubmit {
    fn name(&self) -> &'static str {
        "form"
    }

    async fn attempt(&self, browser: &dyn BrowserSession, _challenge: &ChallengeMatch) -> Result<bool> {
        Ok(acted(browser.execute_script(FORM_SUBMIT_SCRIPT, vec![]).await?))
    }
}

// ============================================================================
// GenericElement - Click any generically tagged challenge element
// ============================================================================

const GENERIC_CLICK_SCRIPT: &str = r##"
var candidates = document.querySelectorAll(
    "[data-sitekey], .captcha, .cf-captcha, .hcaptcha, .g-recaptcha, #challenge-stage input, " +
    "#challenge-stage button, .challenge-form input[type='checkbox'], button[id*='verify'], input[value*='Verify']");
for (var i = 0; i < candidates.length; i++) {
    var el = candidates[i];
    var r = el.getBoundingClientRect();
    if (r.width < 1 || r.height < 1) continue;
    el.scrollIntoView({ block: 'center' });
    el.click();
    return true;
}
return false;
"##;

/// Clicks the first visible generically tagged challenge element
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericElement;

#[async_trait]
impl BypassStrategy for GenericElement {
    fn name(&self) -> &'static str {
        "generic"
    }

    async fn attempt(&self, browser: &dyn BrowserSession, _challenge: &ChallengeMatch) -> Result<bool> {
        Ok(acted(browser.execute_script(GENERIC_CLICK_SCRIPT, vec![]).await?))
    }
}
