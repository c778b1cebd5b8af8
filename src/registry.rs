use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::domain::{CancelFn, CancelToken, Category, Operation, OperationSnapshot};
use crate::ports::Dispatch;

/// Maximum number of finished operations retained for user review.
/// The oldest entry is evicted first once the cap is reached.
pub const MAX_HISTORY: usize = 100;

/// Callback invoked (on the UI thread, via the injected dispatcher) once per
/// observable state change of any operation.
pub type Listener = Arc<dyn Fn(OperationSnapshot) + Send + Sync>;

/// Tracks all live operations and a capped history of finished ones.
///
/// One instance per application, passed explicitly to whatever starts or
/// displays operations; tests construct their own isolated instance. Clones
/// share the same underlying state.
///
/// Background workers mutate operations from any thread; the UI layer
/// registers a listener and re-reads [`active`](Registry::active) /
/// [`history`](Registry::history) snapshots when it fires. Listener
/// invocation always happens after the internal lock is released, so a
/// listener may safely re-enter the registry.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegistryShared>,
}

pub(crate) struct RegistryShared {
    next_id: AtomicU64,
    dispatch: Arc<dyn Dispatch>,
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    /// Only `Active` operations live here; terminal ones move to `history`.
    operations: HashMap<u64, Arc<Operation>>,
    /// Most-recent-completion-first, capped at [`MAX_HISTORY`].
    history: VecDeque<OperationSnapshot>,
    listeners: Vec<Listener>,
}

impl Registry {
    pub fn new(dispatch: Arc<dyn Dispatch>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                next_id: AtomicU64::new(0),
                dispatch,
                inner: Mutex::new(RegistryInner::default()),
            }),
        }
    }

    /// Starts tracking a new operation. Infallible; returns the live handle
    /// the caller keeps to report progress and completion.
    pub fn start(
        &self,
        name: impl Into<String>,
        category: Category,
        cancellable: bool,
    ) -> Arc<Operation> {
        self.start_inner(name.into(), category, cancellable, None)
    }

    /// Starts a cancellable operation with a cancel hook installed up front.
    /// The hook fires at most once, when the user requests cancellation.
    pub fn start_with_cancel(
        &self,
        name: impl Into<String>,
        category: Category,
        cancel: CancelFn,
    ) -> Arc<Operation> {
        self.start_inner(name.into(), category, true, Some(cancel))
    }

    /// Starts a cancellable operation and returns a [`CancelToken`] wired to
    /// its cancel hook, for workers that poll a flag between units of work.
    pub fn start_with_token(
        &self,
        name: impl Into<String>,
        category: Category,
    ) -> (Arc<Operation>, CancelToken) {
        let token = CancelToken::new();
        let hook = token.clone();
        let op = self.start_inner(
            name.into(),
            category,
            true,
            Some(Box::new(move || hook.cancel())),
        );
        (op, token)
    }

    fn start_inner(
        &self,
        name: String,
        category: Category,
        cancellable: bool,
        cancel: Option<CancelFn>,
    ) -> Arc<Operation> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let op = Arc::new(Operation::new(
            id,
            name,
            category,
            cancellable,
            cancel,
            Arc::downgrade(&self.shared),
        ));
        debug!("Operation {} started: {} ({})", id, op.name(), category);

        let snapshot = {
            let mut inner = self.shared.lock();
            inner.operations.insert(id, Arc::clone(&op));
            op.snapshot()
        };
        self.shared.notify(snapshot);
        op
    }

    /// Re-resolves an ID into the live handle, or `None` once the operation
    /// finished (or never existed). UI click handlers use this because their
    /// snapshots are copies and cannot be mutated directly.
    pub fn get(&self, id: u64) -> Option<Arc<Operation>> {
        self.shared.lock().operations.get(&id).cloned()
    }

    /// Cancels the operation with the given ID, if it is still live.
    pub fn cancel(&self, id: u64) {
        if let Some(op) = self.get(id) {
            op.cancel();
        }
    }

    /// Snapshot copies of all live operations, in unspecified order.
    pub fn active(&self) -> Vec<OperationSnapshot> {
        let inner = self.shared.lock();
        inner.operations.values().map(|op| op.snapshot()).collect()
    }

    /// Snapshot copies of finished operations, most recent first.
    pub fn history(&self) -> Vec<OperationSnapshot> {
        let inner = self.shared.lock();
        inner.history.iter().cloned().collect()
    }

    /// Number of live operations, derived from the live map on every call.
    pub fn active_count(&self) -> usize {
        self.shared.lock().operations.len()
    }

    /// Registers a listener invoked once per observable state change, via
    /// the injected dispatcher. Listeners are kept for the registry's
    /// lifetime and never removed.
    pub fn add_listener(&self, listener: impl Fn(OperationSnapshot) + Send + Sync + 'static) {
        self.shared.lock().listeners.push(Arc::new(listener));
    }
}

impl RegistryShared {
    // Same poisoning stance as the operation lock: the maps stay valid even
    // if a listener-registering thread panicked, so recover the guard.
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands a snapshot to every listener through the dispatcher. Must be
    /// called without the inner lock held; the listener list is copied out
    /// first so a listener can re-enter the registry.
    pub(crate) fn notify(&self, snapshot: OperationSnapshot) {
        let listeners: Vec<Listener> = self.lock().listeners.clone();
        for listener in listeners {
            let snapshot = snapshot.clone();
            self.dispatch
                .dispatch(Box::new(move || listener(snapshot)));
        }
    }

    /// Moves a now-terminal operation out of the live map into history.
    ///
    /// Called by the operation itself after its terminal transition; the
    /// transition guard there runs this at most once per operation. History
    /// keeps the newest [`MAX_HISTORY`] entries.
    pub(crate) fn retire(&self, snapshot: OperationSnapshot) {
        {
            let mut inner = self.lock();
            if inner.operations.remove(&snapshot.id).is_none() {
                return;
            }
            inner.history.push_front(snapshot.clone());
            inner.history.truncate(MAX_HISTORY);
        }
        debug!(
            "Operation {} finished: {} [{}]",
            snapshot.id, snapshot.name, snapshot.state
        );
        self.notify(snapshot);
    }
}
