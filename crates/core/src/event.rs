// Event domain types
//
// An Event is one tracked feed row, from first observation to a terminal
// outcome. Events are process-local and keyed by `row_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notify::NotificationHandle;

/// One normalized row read from the feed table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedRow {
    /// Stable key from the feed row (opaque)
    pub row_id: String,
    /// Subject's number/address, digits only
    pub endpoint: String,
}

impl FeedRow {
    pub fn new(row_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            row_id: row_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Event lifecycle state.
/// - `active`: row is (or was very recently) present in the feed
/// - `claimed`: completed and owned by a worker
/// - `delivered`: artifact was retrieved and dispatched
/// - `failed`: a genuine error ended retrieval
/// - `timed_out`: retrieval budget exhausted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Active,
    Claimed,
    Delivered,
    Failed,
    TimedOut,
}

impl EventState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventState::Delivered | EventState::Failed | EventState::TimedOut
        )
    }

    /// Whether `self -> next` is a legal lifecycle transition
    pub fn can_transition_to(&self, next: EventState) -> bool {
        match (self, next) {
            (EventState::Active, EventState::Active) => true,
            (EventState::Active, EventState::Claimed) => true,
            (EventState::Claimed, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventState::Active => write!(f, "active"),
            EventState::Claimed => write!(f, "claimed"),
            EventState::Delivered => write!(f, "delivered"),
            EventState::Failed => write!(f, "failed"),
            EventState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// A tracked call/message occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stable key from the feed row
    pub row_id: String,
    /// Digits of the subject's number; used for retrieval and display
    pub endpoint: String,
    /// Identifier used to request the artifact, derived from `row_id`
    pub correlation_uuid: String,
    /// Current lifecycle state
    pub state: EventState,
    /// When the row was first observed
    pub detected_at: DateTime<Utc>,
    /// When the row was last present in a snapshot
    pub last_seen_at: DateTime<Utc>,
    /// When the event was judged complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Retrieval attempts made so far
    pub check_count: u32,
    /// The one live status message owned by this event, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<NotificationHandle>,
}

impl Event {
    /// Allocate a new active event for a row observed for the first time.
    ///
    /// `correlation_prefix` is stripped from the row id when present; feeds
    /// that use the bare call uuid as the row id pass `None`.
    pub fn detect(row: FeedRow, correlation_prefix: Option<&str>, now: DateTime<Utc>) -> Self {
        let correlation_uuid = correlation_prefix
            .and_then(|prefix| row.row_id.strip_prefix(prefix))
            .unwrap_or(&row.row_id)
            .to_string();

        Self {
            row_id: row.row_id,
            endpoint: row.endpoint,
            correlation_uuid,
            state: EventState::Active,
            detected_at: now,
            last_seen_at: now,
            completed_at: None,
            check_count: 0,
            status_message: None,
        }
    }

    /// Record that the row is still present
    pub fn mark_seen(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = now;
    }

    /// Time since the row was last present
    pub fn unseen_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_seen_at)
    }

    /// Move to `next`, refusing illegal transitions
    pub fn transition(&mut self, next: EventState) -> crate::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(crate::PipelineError::Internal(anyhow::anyhow!(
                "illegal event transition {} -> {} for row {}",
                self.state,
                next,
                self.row_id
            )));
        }
        self.state = next;
        Ok(())
    }

    /// ACTIVE -> claimed, stamping `completed_at`
    pub fn claim(&mut self, now: DateTime<Utc>) -> crate::Result<()> {
        self.transition(EventState::Claimed)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Replace the live status message, returning the one it supersedes
    pub fn replace_status_message(
        &mut self,
        handle: Option<NotificationHandle>,
    ) -> Option<NotificationHandle> {
        std::mem::replace(&mut self.status_message, handle)
    }
}
