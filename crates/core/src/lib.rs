// Call Relay Core
//
// Shared abstractions for the call-feed relay pipeline.
//
// Key design decisions:
// - The browser and the messaging endpoint sit behind traits (BrowserSession,
//   Notifier) so every component can run against in-memory fakes
// - Domain entities (Event, Session, Artifact, NotificationHandle) live here
//   for shared use by the browser, notify and worker crates
// - A single error taxonomy (PipelineError); each component converts
//   collaborator failures at its own boundary
// - Configuration is a flat set of named values read from the environment

pub mod artifact;
pub mod browser;
pub mod config;
pub mod error;
pub mod event;
pub mod format;
pub mod notify;
pub mod region;
pub mod session;
pub mod telemetry;

// In-memory implementations for testing
pub mod memory;

// Re-exports for convenience
pub use artifact::{Artifact, ArtifactSource};
pub use browser::{BrowserGuard, BrowserSession, SharedBrowser};
pub use config::{
    DispatchConfig, GateConfig, MonitorConfig, PoolConfig, RefreshConfig, RetrievalConfig,
    SiteConfig, TrackerConfig, WebDriverConfig,
};
pub use error::{PipelineError, Result};
pub use event::{Event, EventState, FeedRow};
pub use notify::{Attachment, NotificationHandle, Notifier};
pub use region::{Region, RegionLookup, UnknownRegion};
pub use session::{BrowserCookie, Session, SessionAccess, SessionSnapshot};
