// Deletion scheduler
//
// One pending task per message id. Scheduling again for the same id replaces
// the earlier task; cancelling aborts it. A task that fires removes its own
// entry only if it has not been replaced in the meantime.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

#[derive(Debug)]
struct Pending {
    generation: u64,
    task: AbortHandle,
}

/// Cancellable delayed actions keyed by message id
#[derive(Debug, Clone, Default)]
pub struct DeletionScheduler {
    pending: Arc<DashMap<i64, Pending>>,
    generation: Arc<AtomicU64>,
}

impl DeletionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `after` unless cancelled first. Returns false when
    /// no runtime is available to run the timer.
    pub fn schedule<F>(&self, message_id: i64, after: Duration, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(message_id, error = %e, "No runtime for scheduled delete");
                return false;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        // Shard stays locked until the new task is registered
        let entry = self.pending.entry(message_id);
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            pending.remove_if(&message_id, |_, p| p.generation == generation);
            action.await;
        });

        let registered = Pending {
            generation,
            task: task.abort_handle(),
        };
        match entry {
            Entry::Occupied(mut occupied) => occupied.insert(registered).task.abort(),
            Entry::Vacant(vacant) => {
                vacant.insert(registered);
            }
        }
        debug!(message_id, after_ms = after.as_millis() as u64, "Delete scheduled");
        true
    }

    /// Abort the pending action for `message_id`. Returns whether one was
    /// pending.
    pub fn cancel(&self, message_id: i64) -> bool {
        match self.pending.remove(&message_id) {
            Some((_, pending)) => {
                pending.task.abort();
                debug!(message_id, "Scheduled delete cancelled");
                true
            }
            None => false,
        }
    }

    /// Abort every pending action
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn is_pending(&self, message_id: i64) -> bool {
        self.pending.contains_key(&message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let make = move || {
            let c = Arc::clone(&c);
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = DeletionScheduler::new();
        let (count, action) = counter();

        assert!(scheduler.schedule(7, Duration::from_secs(10), action()));
        assert!(scheduler.is_pending(7));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_action() {
        let scheduler = DeletionScheduler::new();
        let (count, action) = counter();

        scheduler.schedule(7, Duration::from_secs(10), action());
        assert!(scheduler.cancel(7));
        assert!(!scheduler.cancel(7));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let scheduler = DeletionScheduler::new();
        let (count, action) = counter();

        scheduler.schedule(7, Duration::from_secs(10), action());
        scheduler.schedule(7, Duration::from_secs(30), action());
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_pending(7));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = DeletionScheduler::new();
        let (count, action) = counter();
        for id in 1..=3 {
            scheduler.schedule(id, Duration::from_secs(5), action());
        }

        assert_eq!(scheduler.cancel_all(), 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_without_runtime() {
        let scheduler = DeletionScheduler::new();
        assert!(!scheduler.schedule(1, Duration::from_secs(1), async {}));
        assert_eq!(scheduler.pending_count(), 0);
    }
}
