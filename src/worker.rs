//! Supervised unit-of-work primitive.
//!
//! A [`Worker`] is a restartable background task with an observable
//! lifecycle: `Starting → Working → Stopping → Stopped`. The supervisor
//! restarts any worker it finds `Stopped`; a worker body reports `Working`
//! once its setup (bind, resolve) has succeeded and `Stopping` on the way
//! out, and the wrapper pins the state to `Stopped` when the body exits,
//! however it exits.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, debug_span, Instrument};

/// Lifecycle states of a supervised unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Starting = 0,
    Working = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Working,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// A restartable unit of work with observable lifecycle state.
#[derive(Debug)]
pub(crate) struct Worker {
    name: &'static str,
    state: Arc<AtomicU8>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl Worker {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(AtomicU8::new(WorkerState::Stopped as u8)),
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    /// Request cooperative stop. Observed by the body through its handle;
    /// sticky across restarts, so a stopped worker stays down.
    pub(crate) fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Wait until every run of this worker has finished.
    pub(crate) async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Launch one run of the worker.
    ///
    /// The body receives a [`WorkerHandle`] for state reporting and stop
    /// observation. Must be called from within a tokio runtime.
    pub(crate) fn start<F, Fut>(&self, body: F)
    where
        F: FnOnce(WorkerHandle) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.state
            .store(WorkerState::Starting as u8, Ordering::SeqCst);
        let handle = WorkerHandle {
            state: self.state.clone(),
            stop: self.stop.clone(),
        };
        let state = self.state.clone();
        let name = self.name;
        let fut = body(handle);
        self.tasks.spawn(
            async move {
                debug!("worker starting");
                fut.await;
                state.store(WorkerState::Stopped as u8, Ordering::SeqCst);
                debug!("worker stopped");
            }
            .instrument(debug_span!("worker", name)),
        );
    }
}

/// Handed to a worker body: state setters plus the stop signal.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    state: Arc<AtomicU8>,
    stop: CancellationToken,
}

impl WorkerHandle {
    pub(crate) fn set_working(&self) {
        self.state
            .store(WorkerState::Working as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_stopping(&self) {
        self.state
            .store(WorkerState::Stopping as u8, Ordering::SeqCst);
    }

    /// The cooperative stop signal for this worker.
    pub(crate) fn stop(&self) -> &CancellationToken {
        &self.stop
    }
}
