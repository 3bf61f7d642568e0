// Error types for the relay pipeline
//
// Each variant maps to one failure kind a component can act on. Components
// convert collaborator failures into one of these at their own boundary;
// nothing propagates out of the polling loop or a worker as a fault.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur inside the relay pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An anti-automation interstitial is blocking the page
    #[error("challenge detected: {0}")]
    ChallengeDetected(String),

    /// The session could not be made usable (bypass and manual wait both failed)
    #[error("session blocked at {url}")]
    SessionBlocked { url: String },

    /// The feed could not be read this cycle
    #[error("snapshot read error: {0}")]
    SnapshotRead(String),

    /// The artifact is not available yet; drives another retrieval attempt
    #[error("artifact not ready: {0}")]
    ArtifactNotReady(String),

    /// The artifact body is at or below the minimum byte floor
    #[error("artifact too small: {size} bytes (floor {floor})")]
    ArtifactTooSmall { size: u64, floor: u64 },

    /// The artifact request failed (transport error, bad status, bad content type)
    #[error("artifact fetch error: {0}")]
    ArtifactFetch(String),

    /// Retrieval exhausted its attempt or wall-clock budget
    #[error("retrieval timed out after {attempts} attempts ({elapsed:?})")]
    RetrievalTimedOut { attempts: u32, elapsed: Duration },

    /// The messaging endpoint rejected or failed a call
    #[error("dispatch failure: {0}")]
    Dispatch(String),

    /// The controlled browsing session failed a primitive
    #[error("browser error: {0}")]
    Browser(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Local filesystem error while handling a transient artifact
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Create a snapshot read error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        PipelineError::SnapshotRead(msg.into())
    }

    /// Create a not-ready error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        PipelineError::ArtifactNotReady(msg.into())
    }

    /// Create an artifact fetch error
    pub fn fetch(msg: impl Into<String>) -> Self {
        PipelineError::ArtifactFetch(msg.into())
    }

    /// Create a dispatch error
    pub fn dispatch(msg: impl Into<String>) -> Self {
        PipelineError::Dispatch(msg.into())
    }

    /// Create a browser error
    pub fn browser(msg: impl Into<String>) -> Self {
        PipelineError::Browser(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    /// Whether this error only means "try again on the next attempt".
    ///
    /// Not-ready, too-small and fetch errors count against `check_count` but
    /// never end a retrieval on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ArtifactNotReady(_)
                | PipelineError::ArtifactTooSmall { .. }
                | PipelineError::ArtifactFetch(_)
                | PipelineError::Browser(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(PipelineError::not_ready("pending").is_retryable());
        assert!(PipelineError::ArtifactTooSmall { size: 10, floor: 1000 }.is_retryable());
        assert!(PipelineError::fetch("404").is_retryable());
        assert!(!PipelineError::Io(std::io::Error::other("disk full")).is_retryable());
        assert!(!PipelineError::RetrievalTimedOut {
            attempts: 3,
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = PipelineError::ArtifactTooSmall { size: 5, floor: 1000 };
        assert_eq!(err.to_string(), "artifact too small: 5 bytes (floor 1000)");
    }
}
