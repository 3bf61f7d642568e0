//! Event Lifecycle Tracker
//!
//! Diffs each feed snapshot against the in-memory Event map. Only the polling
//! loop owns a tracker; completed events leave the map at hand-off, so a
//! row id that shows up again afterwards is a new Event.

use std::collections::HashMap;

use callrelay_core::{Event, FeedRow, NotificationHandle, TrackerConfig};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Tracked {
    event: Event,
    /// Consecutive snapshots the row was missing from
    missed: u32,
}

/// What one snapshot changed
#[derive(Debug, Default)]
pub struct Observation {
    /// Rows seen for the first time, in feed order
    pub detected: Vec<Event>,
    /// Active events judged complete, removed from the map
    pub completed: Vec<Event>,
}

impl Observation {
    pub fn is_empty(&self) -> bool {
        self.detected.is_empty() && self.completed.is_empty()
    }
}

/// In-memory Event map keyed by row id
#[derive(Debug)]
pub struct LifecycleTracker {
    config: TrackerConfig,
    correlation_prefix: Option<String>,
    events: HashMap<String, Tracked>,
    snapshot_failures: u32,
}

impl LifecycleTracker {
    pub fn new(config: TrackerConfig, correlation_prefix: Option<String>) -> Self {
        Self {
            config,
            correlation_prefix,
            events: HashMap::new(),
            snapshot_failures: 0,
        }
    }

    /// Apply one snapshot
    ///
    /// A row present in `rows` is either new (allocated and reported as
    /// detected) or still active (last seen updated, nothing reported). An
    /// active row that is missing completes once it has been absent for
    /// `absent_cycles` snapshots or unseen for longer than the liveness window.
    pub fn observe(&mut self, rows: &[FeedRow], now: DateTime<Utc>) -> Observation {
        self.snapshot_failures = 0;
        let mut observation = Observation::default();
        let mut present = std::collections::HashSet::with_capacity(rows.len());

        for row in rows {
            if !present.insert(row.row_id.as_str()) {
                continue;
            }
            match self.events.get_mut(&row.row_id) {
                Some(tracked) => {
                    tracked.event.mark_seen(now);
                    tracked.missed = 0;
                }
                None => {
                    let event = Event::detect(row.clone(), self.correlation_prefix.as_deref(), now);
                    info!(row_id = %event.row_id, endpoint = %event.endpoint, "New event detected");
                    observation.detected.push(event.clone());
                    self.events
                        .insert(row.row_id.clone(), Tracked { event, missed: 0 });
                }
            }
        }

        let window = chrono::Duration::from_std(self.config.liveness_window)
            .unwrap_or(chrono::Duration::MAX);
        let mut finished = Vec::new();
        for (row_id, tracked) in self.events.iter_mut() {
            if present.contains(row_id.as_str()) {
                continue;
            }
            tracked.missed += 1;
            let stale = tracked.event.unseen_for(now) > window;
            if tracked.missed >= self.config.absent_cycles || stale {
                debug!(%row_id, missed = tracked.missed, stale, "Event completed");
                finished.push(row_id.clone());
            }
        }

        for row_id in finished {
            if let Some(tracked) = self.events.remove(&row_id) {
                observation.completed.push(tracked.event);
            }
        }
        observation
            .completed
            .sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        observation
    }

    /// Record the status message sent for an active event
    ///
    /// Returns the handle it replaced, which the caller must delete.
    pub fn attach_status(
        &mut self,
        row_id: &str,
        handle: NotificationHandle,
    ) -> Option<NotificationHandle> {
        match self.events.get_mut(row_id) {
            Some(tracked) => tracked.event.replace_status_message(Some(handle)),
            None => Some(handle),
        }
    }

    /// Count a failed snapshot read. Returns true when the consecutive
    /// failure ceiling is reached, resetting the count.
    pub fn record_snapshot_failure(&mut self) -> bool {
        self.snapshot_failures += 1;
        if self.snapshot_failures >= self.config.snapshot_failure_ceiling.max(1) {
            warn!(
                failures = self.snapshot_failures,
                "Snapshot failure ceiling reached"
            );
            self.snapshot_failures = 0;
            return true;
        }
        false
    }

    pub fn snapshot_failures(&self) -> u32 {
        self.snapshot_failures
    }

    pub fn get(&self, row_id: &str) -> Option<&Event> {
        self.events.get(row_id).map(|t| &t.event)
    }

    pub fn is_tracking(&self, row_id: &str) -> bool {
        self.events.contains_key(row_id)
    }

    /// Number of active events
    pub fn active_count(&self) -> usize {
        self.events.len()
    }

    /// Remove every active event, returning them
    pub fn drain(&mut self) -> Vec<Event> {
        self.events.drain().map(|(_, t)| t.event).collect()
    }
}
