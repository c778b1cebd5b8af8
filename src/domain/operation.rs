use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::registry::RegistryShared;

/// Progress value meaning "running, but completion fraction unknown".
pub const INDETERMINATE: f64 = -1.0;

/// Minimum age before an active operation offers a cancel affordance.
/// Operations younger than this are likely to finish before the user
/// could react, so the UI should not flash a cancel button at them.
pub const MIN_CANCEL_AGE: Duration = Duration::from_secs(5);

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// The operation is in progress.
    Active,
    /// The operation finished successfully.
    Completed,
    /// The operation finished with an error.
    Failed,
    /// The operation was cancelled by the user.
    Cancelled,
}

impl State {
    /// Terminal states are absorbing: no further transitions are permitted.
    pub fn is_terminal(self) -> bool {
        !matches!(self, State::Active)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Active => "Active",
            State::Completed => "Completed",
            State::Failed => "Failed",
            State::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

/// Kind of work an operation performs, used for UI grouping only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Package installation.
    Install,
    /// System or package updates.
    Update,
    /// Data loading.
    Loading,
    /// Cleanup and maintenance.
    Maintenance,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Install => "install",
            Category::Update => "update",
            Category::Loading => "loading",
            Category::Maintenance => "maintenance",
        };
        write!(f, "{s}")
    }
}

/// Cancel hook supplied by the caller at start time; invoked at most once.
pub type CancelFn = Box<dyn FnOnce() + Send>;

/// Retry hook installed by the caller after a failure; invoked by the UI
/// layer, never by this crate.
pub type RetryFn = Arc<dyn Fn() + Send + Sync>;

/// Mutable fields, guarded by the operation's own lock.
struct OperationFields {
    state: State,
    ended_at: Option<Instant>,
    progress: f64,
    message: String,
    error: Option<Arc<anyhow::Error>>,
    cancel: Option<CancelFn>,
    retry: Option<RetryFn>,
}

/// A single tracked unit of background work.
///
/// Created exclusively by [`Registry::start`](crate::Registry::start) and
/// handed back to the caller, who drives it with [`update_progress`] and
/// [`complete`]. Each operation owns its own lock so high-frequency progress
/// ticks never contend on the registry's structural lock.
///
/// [`update_progress`]: Operation::update_progress
/// [`complete`]: Operation::complete
pub struct Operation {
    id: u64,
    name: String,
    category: Category,
    cancellable: bool,
    started_at: Instant,
    fields: Mutex<OperationFields>,
    registry: Weak<RegistryShared>,
}

impl Operation {
    pub(crate) fn new(
        id: u64,
        name: String,
        category: Category,
        cancellable: bool,
        cancel: Option<CancelFn>,
        registry: Weak<RegistryShared>,
    ) -> Self {
        Self {
            id,
            name,
            category,
            cancellable,
            started_at: Instant::now(),
            fields: Mutex::new(OperationFields {
                state: State::Active,
                ended_at: None,
                progress: INDETERMINATE,
                message: String::new(),
                error: None,
                cancel,
                retry: None,
            }),
            registry,
        }
    }

    // A poisoned lock only means some worker panicked mid-update; the fields
    // themselves are always left valid, so recover the guard instead of
    // propagating the panic into every reader.
    fn lock(&self) -> MutexGuard<'_, OperationFields> {
        self.fields.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn cancellable(&self) -> bool {
        self.cancellable
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    pub fn message(&self) -> String {
        self.lock().message.clone()
    }

    /// How long the operation ran (terminal) or has been running (active).
    pub fn duration(&self) -> Duration {
        match self.lock().ended_at {
            Some(ended) => ended.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    /// Whether the UI should currently offer cancellation: requires the
    /// cancellable flag, an active state, and more than [`MIN_CANCEL_AGE`]
    /// of runtime.
    pub fn is_cancellable(&self) -> bool {
        self.is_cancellable_at(Instant::now())
    }

    /// Pure variant of [`is_cancellable`](Operation::is_cancellable) taking
    /// an explicit clock reading, so the age threshold can be tested without
    /// sleeping.
    pub fn is_cancellable_at(&self, now: Instant) -> bool {
        if !self.cancellable || self.state().is_terminal() {
            return false;
        }
        now.duration_since(self.started_at) > MIN_CANCEL_AGE
    }

    /// Updates progress and status message.
    ///
    /// Negative values are stored as [`INDETERMINATE`]; values above 1.0
    /// clamp to 1.0. Calling after the operation turned terminal is a no-op,
    /// since producers may race with completion.
    pub fn update_progress(&self, progress: f64, message: impl Into<String>) {
        let snapshot = {
            let mut fields = self.lock();
            if fields.state.is_terminal() {
                return;
            }
            fields.progress = normalize_progress(progress);
            fields.message = message.into();
            self.snapshot_locked(&fields)
        };
        trace!(
            "Operation {} progress {:.2}: {}",
            self.id,
            snapshot.progress,
            snapshot.message
        );
        self.publish(snapshot);
    }

    /// Marks the operation completed (`Ok`) or failed (`Err`).
    ///
    /// Idempotent: the first terminal transition wins, so a worker finishing
    /// a moment after the user cancelled leaves the state `Cancelled`.
    pub fn complete(&self, result: anyhow::Result<()>) {
        let snapshot = {
            let mut fields = self.lock();
            if fields.state.is_terminal() {
                return;
            }
            fields.ended_at = Some(Instant::now());
            match result {
                Ok(()) => fields.state = State::Completed,
                Err(err) => {
                    fields.state = State::Failed;
                    fields.error = Some(Arc::new(err));
                }
            }
            // The cancel hook must never fire once the operation is done.
            fields.cancel = None;
            self.snapshot_locked(&fields)
        };
        self.retire(snapshot);
    }

    /// Requests cancellation.
    ///
    /// Optimistic-immediate: the state flips to `Cancelled` right away so the
    /// UI reflects the request instantly, and the cancel hook fires at most
    /// once. The underlying work stops on its own schedule; the worker's
    /// eventual `complete` call becomes a no-op. Non-cancellable or already
    /// terminal operations ignore the request.
    pub fn cancel(&self) {
        if !self.cancellable {
            return;
        }
        let (snapshot, hook) = {
            let mut fields = self.lock();
            if fields.state.is_terminal() {
                return;
            }
            fields.state = State::Cancelled;
            fields.ended_at = Some(Instant::now());
            let hook = fields.cancel.take();
            (self.snapshot_locked(&fields), hook)
        };
        // Invoke the hook outside the lock; it may re-enter this operation.
        if let Some(hook) = hook {
            hook();
        }
        self.retire(snapshot);
    }

    /// Installs a hook the UI can invoke to retry this exact operation after
    /// a failure. The hook survives into snapshots, including history.
    pub fn set_retry(&self, retry: impl Fn() + Send + Sync + 'static) {
        self.lock().retry = Some(Arc::new(retry));
    }

    /// Returns a coherent copy of all fields at this instant.
    pub fn snapshot(&self) -> OperationSnapshot {
        let fields = self.lock();
        self.snapshot_locked(&fields)
    }

    fn snapshot_locked(&self, fields: &OperationFields) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id,
            name: self.name.clone(),
            category: self.category,
            state: fields.state,
            started_at: self.started_at,
            ended_at: fields.ended_at,
            progress: fields.progress,
            message: fields.message.clone(),
            cancellable: self.cancellable,
            error: fields.error.clone(),
            retry: fields.retry.clone(),
        }
    }

    fn publish(&self, snapshot: OperationSnapshot) {
        if let Some(registry) = self.registry.upgrade() {
            registry.notify(snapshot);
        }
    }

    fn retire(&self, snapshot: OperationSnapshot) {
        if let Some(registry) = self.registry.upgrade() {
            registry.retire(snapshot);
        }
    }
}

fn normalize_progress(progress: f64) -> f64 {
    if progress.is_nan() || progress < 0.0 {
        INDETERMINATE
    } else if progress > 1.0 {
        1.0
    } else {
        progress
    }
}

/// A plain-data copy of an operation's fields at a point in time.
///
/// All read APIs return these instead of live references, so external code
/// cannot mutate registry-owned state. Listener callbacks receive them too.
#[derive(Clone)]
pub struct OperationSnapshot {
    pub id: u64,
    pub name: String,
    pub category: Category,
    pub state: State,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub progress: f64,
    pub message: String,
    pub cancellable: bool,
    pub error: Option<Arc<anyhow::Error>>,
    pub retry: Option<RetryFn>,
}

impl OperationSnapshot {
    pub fn duration(&self) -> Duration {
        match self.ended_at {
            Some(ended) => ended.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    pub fn is_cancellable(&self) -> bool {
        self.is_cancellable_at(Instant::now())
    }

    pub fn is_cancellable_at(&self, now: Instant) -> bool {
        if !self.cancellable || self.state.is_terminal() {
            return false;
        }
        now.duration_since(self.started_at) > MIN_CANCEL_AGE
    }

    /// Display string for the failure, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

impl fmt::Debug for OperationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSnapshot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("state", &self.state)
            .field("progress", &self.progress)
            .field("message", &self.message)
            .field("cancellable", &self.cancellable)
            .field("error", &self.error)
            .field("has_retry", &self.retry.is_some())
            .finish()
    }
}

impl fmt::Display for OperationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.name, self.state, self.category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(State::Active.to_string(), "Active");
        assert_eq!(State::Completed.to_string(), "Completed");
        assert_eq!(State::Failed.to_string(), "Failed");
        assert_eq!(State::Cancelled.to_string(), "Cancelled");
    }

    #[test]
    fn test_state_terminal() {
        assert!(!State::Active.is_terminal());
        assert!(State::Completed.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::Cancelled.is_terminal());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(Category::Install.to_string(), "install");
        assert_eq!(Category::Update.to_string(), "update");
        assert_eq!(Category::Loading.to_string(), "loading");
        assert_eq!(Category::Maintenance.to_string(), "maintenance");
    }

    #[test]
    fn test_normalize_progress_bounds() {
        assert_eq!(normalize_progress(0.0), 0.0);
        assert_eq!(normalize_progress(0.5), 0.5);
        assert_eq!(normalize_progress(1.0), 1.0);
        assert_eq!(normalize_progress(1.5), 1.0);
        assert_eq!(normalize_progress(-1.0), INDETERMINATE);
        assert_eq!(normalize_progress(-0.3), INDETERMINATE);
        assert_eq!(normalize_progress(f64::NAN), INDETERMINATE);
    }

    fn standalone(name: &str, cancellable: bool) -> Operation {
        Operation::new(
            1,
            name.to_string(),
            Category::Loading,
            cancellable,
            None,
            Weak::new(),
        )
    }

    #[test]
    fn test_new_operation_defaults() {
        let op = standalone("Quick Task", false);
        assert_eq!(op.state(), State::Active);
        assert_eq!(op.progress(), INDETERMINATE);
        assert_eq!(op.message(), "");
        assert_eq!(op.name(), "Quick Task");
    }

    #[test]
    fn test_is_cancellable_respects_age_threshold() {
        let op = standalone("Quick Task", true);

        // Too young, even though the flag is set.
        assert!(!op.is_cancellable());
        assert!(!op.is_cancellable_at(op.started_at()));

        // Simulate 5+ seconds of runtime without sleeping.
        let later = op.started_at() + Duration::from_secs(6);
        assert!(op.is_cancellable_at(later));
    }

    #[test]
    fn test_is_cancellable_false_without_flag() {
        let op = standalone("Quick Task", false);
        let later = op.started_at() + Duration::from_secs(60);
        assert!(!op.is_cancellable_at(later));
    }

    #[test]
    fn test_is_cancellable_false_once_terminal() {
        let op = standalone("Quick Task", true);
        op.complete(Ok(()));
        let later = op.started_at() + Duration::from_secs(60);
        assert!(!op.is_cancellable_at(later));
    }

    #[test]
    fn test_complete_records_error_and_end() {
        let op = standalone("Install Firefox", false);
        op.complete(Err(anyhow::anyhow!("network unreachable")));

        let snap = op.snapshot();
        assert_eq!(snap.state, State::Failed);
        assert_eq!(snap.error_message().as_deref(), Some("network unreachable"));
        assert!(snap.ended_at.is_some());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let op = standalone("Update Homebrew", false);
        op.complete(Ok(()));
        let first = op.snapshot();

        op.complete(Err(anyhow::anyhow!("too late")));
        let second = op.snapshot();

        assert_eq!(second.state, State::Completed);
        assert!(second.error.is_none());
        assert_eq!(second.ended_at, first.ended_at);
    }

    #[test]
    fn test_cancel_wins_over_later_complete() {
        let op = standalone("Big Download", true);
        op.cancel();
        op.complete(Ok(()));
        assert_eq!(op.state(), State::Cancelled);
    }

    #[test]
    fn test_cancel_ignored_when_not_cancellable() {
        let op = standalone("Pinned Task", false);
        op.cancel();
        assert_eq!(op.state(), State::Active);
    }

    #[test]
    fn test_cancel_hook_fires_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        let op = Operation::new(
            1,
            "Big Download".to_string(),
            Category::Update,
            true,
            Some(Box::new(move || {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            })),
            Weak::new(),
        );

        op.cancel();
        op.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_progress_after_terminal_is_noop() {
        let op = standalone("Quick Task", false);
        op.update_progress(0.4, "almost");
        op.complete(Ok(()));
        op.update_progress(0.9, "should not stick");

        let snap = op.snapshot();
        assert_eq!(snap.progress, 0.4);
        assert_eq!(snap.message, "almost");
    }

    #[test]
    fn test_duration_frozen_after_terminal() {
        let op = standalone("Quick Task", false);
        op.complete(Ok(()));
        let a = op.duration();
        let b = op.duration();
        assert_eq!(a, b);
    }

    #[test]
    fn test_retry_hook_carried_in_snapshot() {
        let op = standalone("Install Firefox", false);
        assert!(op.snapshot().retry.is_none());

        op.set_retry(|| {});
        assert!(op.snapshot().retry.is_some());
    }
}
