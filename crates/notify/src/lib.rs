// Call Relay Notify
//
// Messaging endpoint for the relay pipeline.
//
// Key design decisions:
// - TelegramNotifier implements the core Notifier trait over the Bot API
// - Every HTTP call carries its own timeout; failures come back as
//   PipelineError::Dispatch and are never retried here
// - DeletionScheduler owns one cancellable timer per message id

pub mod scheduler;
pub mod telegram;

pub use scheduler::DeletionScheduler;
pub use telegram::{DispatchError, TelegramNotifier};
