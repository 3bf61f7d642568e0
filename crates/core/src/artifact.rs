// Artifact types
//
// An Artifact is the recording associated with an Event, held on disk only
// between retrieval and dispatch.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How an artifact was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Played back and captured inside the browsing session
    InSessionCapture,
    /// Fetched over HTTP with the session's cookies
    DirectFetch,
}

impl std::fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactSource::InSessionCapture => write!(f, "in_session_capture"),
            ArtifactSource::DirectFetch => write!(f, "direct_fetch"),
        }
    }
}

/// A retrieved recording
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Transient file the bytes were written to
    pub path: PathBuf,
    /// Recording bytes
    pub bytes: Vec<u8>,
    /// Content type reported by the source, if any
    pub content_type: Option<String>,
    /// Strategy that produced it
    pub source: ArtifactSource,
}

impl Artifact {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// File name component of `path`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording.mp3".to_string())
    }
}

/// Whether a body of `size` bytes clears `floor` (strictly greater)
pub fn exceeds_floor(size: u64, floor: u64) -> bool {
    size > floor
}

/// Whether a content type looks like audio. A missing content type is accepted.
pub fn is_audio_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.is_empty()
        || mime.starts_with("audio/")
        || mime == "application/octet-stream"
        || mime == "video/webm"
}

/// File name for an artifact: digits of the endpoint plus a timestamp
pub fn artifact_file_name(endpoint: &str, stamp: &str, extension: &str) -> String {
    let digits: String = endpoint.chars().filter(|c| c.is_ascii_digit()).collect();
    let tail_start = digits.len().saturating_sub(10);
    format!("call_{}_{}.{}", &digits[tail_start..], stamp, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_is_strict() {
        assert!(!exceeds_floor(1000, 1000));
        assert!(exceeds_floor(1001, 1000));
        assert!(!exceeds_floor(0, 0));
    }

    #[test]
    fn test_audio_content_types() {
        assert!(is_audio_content_type(None));
        assert!(is_audio_content_type(Some("audio/mpeg")));
        assert!(is_audio_content_type(Some("Audio/MPEG; charset=binary")));
        assert!(is_audio_content_type(Some("application/octet-stream")));
        assert!(!is_audio_content_type(Some("text/html; charset=UTF-8")));
        assert!(!is_audio_content_type(Some("application/json")));
    }

    #[test]
    fn test_artifact_file_name() {
        assert_eq!(
            artifact_file_name("+1 (555) 123-4567", "20250101_120000", "mp3"),
            "call_5551234567_20250101_120000.mp3"
        );
        assert_eq!(artifact_file_name("4412", "t", "webm"), "call_4412_t.webm");
    }

    #[test]
    fn test_artifact_file_name_from_path() {
        let artifact = Artifact {
            path: PathBuf::from("/tmp/recordings/call_1_t.mp3"),
            bytes: vec![1, 2, 3],
            content_type: None,
            source: ArtifactSource::DirectFetch,
        };
        assert_eq!(artifact.file_name(), "call_1_t.mp3");
        assert_eq!(artifact.size(), 3);
    }
}
