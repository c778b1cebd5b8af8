use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A unit of work handed across to the UI thread.
pub type Job = Box<dyn FnOnce() + Send>;

/// Port for the injected "run this closure on the UI thread" capability.
///
/// The registry calls this whenever listeners must be notified. GUI toolkits
/// are single-threaded, so the embedding application adapts its main-loop
/// scheduling (glib idle, winit proxy, TUI event loop) behind this trait.
/// Implementations must never block the caller.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Runs jobs immediately on the calling thread.
///
/// For tests and headless embedders where thread affinity does not matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatch;

impl Dispatch for InlineDispatch {
    fn dispatch(&self, job: Job) {
        job();
    }
}

/// Producer half of a channel-backed dispatcher.
///
/// Workers `dispatch` jobs into the queue from any thread; the UI thread
/// drains its [`DispatchQueue`] once per frame or event-loop turn.
#[derive(Clone)]
pub struct QueueDispatch {
    tx: Sender<Job>,
}

/// Consumer half of a channel-backed dispatcher, owned by the UI thread.
pub struct DispatchQueue {
    rx: Receiver<Job>,
}

/// Creates a connected dispatcher/queue pair.
pub fn queue() -> (QueueDispatch, DispatchQueue) {
    let (tx, rx) = unbounded();
    (QueueDispatch { tx }, DispatchQueue { rx })
}

impl Dispatch for QueueDispatch {
    fn dispatch(&self, job: Job) {
        // A closed receiver means the UI loop already shut down; jobs are
        // only repaint signals at that point, so dropping them is fine.
        let _ = self.tx.send(job);
    }
}

impl DispatchQueue {
    /// Runs every job queued so far without blocking. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Blocks up to `timeout` for one job and runs it. Returns whether a job
    /// ran.
    pub fn run_next(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(_) => false,
        }
    }
}
