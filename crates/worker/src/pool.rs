//! Concurrency Coordinator
//!
//! Bounded pool running per-event retrieval and the final notification off
//! the polling loop. A row id is claimed before its worker is spawned and
//! released when the worker finishes, so at most one worker per row id is
//! ever in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use callrelay_core::{
    format, Artifact, Attachment, Event, EventState, Notifier, PipelineError, PoolConfig,
    Region, RegionLookup, SessionSnapshot, SiteConfig,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::reliability::{BudgetExceeded, RetryPolicy};
use crate::retriever::{ArtifactRetriever, RetrievalRequest};

/// A completed event handed from the polling loop to the pool
#[derive(Debug, Clone)]
pub struct HandOff {
    pub event: Event,
    /// Cookies and user agent read from the browser at completion
    pub session: SessionSnapshot,
}

/// Terminal result of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub row_id: String,
    pub state: EventState,
    pub attempts: u32,
}

/// Why a hand-off was refused
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// A worker for this row id is still in flight
    #[error("row {0} already has a worker in flight")]
    AlreadyClaimed(String),

    /// The pool is shutting down
    #[error("worker pool is not accepting work")]
    NotAccepting,

    /// The event cannot be claimed from its current state
    #[error("row {row_id} cannot be claimed from state {state}")]
    InvalidState { row_id: String, state: EventState },
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Shutdown timeout
    #[error("graceful shutdown timed out with {remaining} workers in flight")]
    ShutdownTimeout { remaining: usize },
}

/// Collaborators every worker uses
pub struct RetrievalContext {
    pub retriever: ArtifactRetriever,
    pub notifier: Arc<dyn Notifier>,
    pub regions: Arc<dyn RegionLookup>,
    pub site: SiteConfig,
    pub policy: RetryPolicy,
    /// Replace the processing message with an attempt counter on retries
    pub progress_updates: bool,
}

/// Bounded worker pool keyed by row id
pub struct Coordinator {
    context: Arc<RetrievalContext>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    claims: Arc<DashMap<String, ()>>,
    tasks: TaskTracker,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    outcomes: Option<mpsc::UnboundedSender<WorkerOutcome>>,
}

impl Coordinator {
    pub fn new(context: RetrievalContext, config: PoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            context: Arc::new(context),
            permits: Arc::new(Semaphore::new(config.capacity.max(1))),
            config,
            claims: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            shutdown_tx,
            outcomes: None,
        }
    }

    /// Report each worker's terminal outcome on `tx`
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<WorkerOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    /// Claim the event and queue its worker
    ///
    /// Never waits for a free slot; the worker itself waits for a permit.
    #[instrument(skip(self, handoff), fields(row_id = %handoff.event.row_id))]
    pub fn submit(&self, handoff: HandOff) -> Result<(), SubmitError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::NotAccepting);
        }

        let HandOff { mut event, session } = handoff;
        let row_id = event.row_id.clone();

        let claim = match self.claims.entry(row_id.clone()) {
            Entry::Occupied(_) => {
                warn!(%row_id, "Row already has a worker in flight, dropping hand-off");
                return Err(SubmitError::AlreadyClaimed(row_id));
            }
            Entry::Vacant(slot) => {
                if event.claim(Utc::now()).is_err() {
                    return Err(SubmitError::InvalidState {
                        row_id,
                        state: event.state,
                    });
                }
                slot.insert(());
                ClaimGuard {
                    claims: self.claims.clone(),
                    row_id: row_id.clone(),
                }
            }
        };

        let context = self.context.clone();
        let permits = self.permits.clone();
        let outcomes = self.outcomes.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        self.tasks.spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = shutdown.changed() => {
                    debug!(row_id = %event.row_id, "Shutdown before worker started");
                    return;
                }
            };

            let outcome = run_worker(&context, event, session, shutdown).await;
            drop(permit);
            drop(claim);

            if let (Some(outcome), Some(tx)) = (outcome, outcomes) {
                let _ = tx.send(outcome);
            }
        });

        debug!(%row_id, in_flight = self.in_flight(), "Hand-off accepted");
        Ok(())
    }

    /// Row ids with a claimed worker (queued or running)
    pub fn in_flight(&self) -> usize {
        self.claims.len()
    }

    pub fn is_claimed(&self, row_id: &str) -> bool {
        self.claims.contains_key(row_id)
    }

    /// Stop accepting work and wait for running workers
    ///
    /// Workers between attempts give up at once; a worker mid-attempt gets
    /// until the shutdown timeout.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if !self.accepting.swap(false, Ordering::SeqCst) && self.tasks.is_closed() && self.tasks.is_empty() {
            return Ok(());
        }

        info!(in_flight = self.in_flight(), "Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
        self.tasks.close();

        if tokio::time::timeout(self.config.shutdown_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            let remaining = self.tasks.len();
            warn!(remaining, "Shutdown timeout reached");
            return Err(WorkerPoolError::ShutdownTimeout { remaining });
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

/// Releases the row claim when the worker ends, however it ends
struct ClaimGuard {
    claims: Arc<DashMap<String, ()>>,
    row_id: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.remove(&self.row_id);
    }
}

enum Terminal {
    Delivered(Artifact),
    TimedOut(BudgetExceeded),
    Failed(PipelineError),
    Abandoned,
}

/// Drive one claimed event to a terminal state
///
/// Messages for the event go out strictly in order: processing (replacing
/// detected), optional attempt counters, then the processing message is
/// deleted before the final one is sent.
#[instrument(skip_all, fields(row_id = %event.row_id, endpoint = %event.endpoint))]
async fn run_worker(
    context: &RetrievalContext,
    mut event: Event,
    session: SessionSnapshot,
    mut shutdown: watch::Receiver<bool>,
) -> Option<WorkerOutcome> {
    let notifier = context.notifier.as_ref();
    let region = context.regions.lookup(&event.endpoint);

    let previous = event.replace_status_message(None);
    let processing = format::processing(&event, &region);
    replace_status(notifier, &mut event, previous, &processing).await;

    let request = RetrievalRequest::for_event(&event, &context.site, session);
    let already_elapsed = event
        .completed_at
        .and_then(|at| Utc::now().signed_duration_since(at).to_std().ok())
        .unwrap_or_default();
    let mut budget = context.policy.start(already_elapsed);

    let terminal = loop {
        let attempt = match budget.begin_attempt() {
            Ok(attempt) => attempt,
            Err(exceeded) => break Terminal::TimedOut(exceeded),
        };
        event.check_count = attempt;

        if context.progress_updates && attempt > 1 {
            let text = format::attempt_progress(&event, &region, attempt, context.policy.max_attempts);
            let previous = event.replace_status_message(None);
            replace_status(notifier, &mut event, previous, &text).await;
        }

        debug!(attempt, "Retrieval attempt");
        match tokio::time::timeout(budget.remaining(), context.retriever.retrieve(&request)).await {
            Ok(Ok(artifact)) => break Terminal::Delivered(artifact),
            Ok(Err(e)) if e.is_retryable() => {
                debug!(attempt, error = %e, "Artifact not available yet");
            }
            Ok(Err(e)) => break Terminal::Failed(e),
            Err(_) => {
                break Terminal::TimedOut(BudgetExceeded::WallClock {
                    elapsed: budget.elapsed(),
                    limit: context.policy.max_wait,
                })
            }
        }

        let delay = match budget.next_delay() {
            Ok(delay) => delay,
            Err(exceeded) => break Terminal::TimedOut(exceeded),
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break Terminal::Abandoned,
        }
    };

    if let Some(status) = event.replace_status_message(None) {
        if let Err(e) = notifier.delete(&status).await {
            warn!(message_id = status.message_id, error = %e, "Could not delete processing message");
        }
    }

    let state = match terminal {
        Terminal::Delivered(artifact) => {
            deliver(notifier, &event, &region, artifact).await;
            EventState::Delivered
        }
        Terminal::TimedOut(exceeded) => {
            warn!(attempts = event.check_count, reason = %exceeded, "Retrieval timed out");
            send_final(notifier, &format::retrieval_timed_out(&event, &region)).await;
            EventState::TimedOut
        }
        Terminal::Failed(e) => {
            error!(attempts = event.check_count, error = %e, "Retrieval failed");
            send_final(notifier, &format::retrieval_failed(&event, &region, &e.to_string())).await;
            EventState::Failed
        }
        Terminal::Abandoned => {
            info!(attempts = event.check_count, "Retrieval abandoned at shutdown");
            return None;
        }
    };

    if let Err(e) = event.transition(state) {
        error!(error = %e, "Illegal terminal transition");
    }
    Some(WorkerOutcome {
        row_id: event.row_id,
        state,
        attempts: event.check_count,
    })
}

/// Delete `previous` and send `text` as the event's live status message
async fn replace_status(
    notifier: &dyn Notifier,
    event: &mut Event,
    previous: Option<callrelay_core::NotificationHandle>,
    text: &str,
) {
    match notifier.supersede(previous.as_ref(), text).await {
        Ok(handle) => {
            event.replace_status_message(Some(handle));
        }
        Err(e) => warn!(error = %e, "Status message failed"),
    }
}

async fn deliver(notifier: &dyn Notifier, event: &Event, region: &Region, artifact: Artifact) {
    let path = artifact.path.clone();
    let mut attachment = Attachment::new(artifact.file_name(), artifact.bytes);
    if let Some(content_type) = artifact.content_type {
        attachment = attachment.with_content_type(content_type);
    }

    let size = attachment.len();
    match notifier
        .send_with_attachment(attachment, &format::delivered_caption(event, region))
        .await
    {
        Some(handle) => info!(size, message_id = handle.message_id, source = %artifact.source, "Recording delivered"),
        None => warn!(size, "Recording was not uploaded"),
    }

    if let Err(e) = tokio::fs::remove_file(&path).await {
        debug!(path = %path.display(), error = %e, "Could not remove artifact file");
    }
}

async fn send_final(notifier: &dyn Notifier, text: &str) {
    if let Err(e) = notifier.send(text).await {
        warn!(error = %e, "Final notification failed");
    }
}
