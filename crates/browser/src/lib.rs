// Call Relay Browser
//
// The single controlled browsing session and everything that reads it.
//
// Key design decisions:
// - WebDriverSession speaks the W3C protocol so any driver server works
// - AccessGate is the only component that mutates Session state; callers
//   only see Usable or Blocked
// - FeedSnapshotter is a pure read of the rows currently on screen
// - Bypass strategies are pluggable; failures never leave the gate

pub mod bypass;
pub mod challenge;
pub mod diagnostics;
pub mod gate;
pub mod snapshot;
pub mod webdriver;

pub use bypass::{default_strategies, BypassStrategy, FormSubmit, GenericElement, WidgetInteraction};
pub use challenge::{ChallengeFingerprints, ChallengeMatch, ChallengeSignal};
pub use diagnostics::Diagnostics;
pub use gate::{AccessGate, AccessMode};
pub use snapshot::{FeedSnapshotter, RowParser};
pub use webdriver::{WebDriverError, WebDriverSession};
