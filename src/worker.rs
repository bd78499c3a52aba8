//! Background thread that drains the message channel into the store.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::channel::MessageReceiver;
use crate::error::{Result, StoreError};
use crate::storage::{ExecOutcome, ExecStats, Storage};

/// Totals reported by a running or finished worker.
pub type WorkerStats = ExecStats;

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Blocked on the channel.
    Idle,
    /// Running a message.
    Executing,
    /// Received `Quit` or lost the channel. Terminal.
    Stopped,
}

#[derive(Debug)]
struct Shared {
    state: WorkerState,
    stats: WorkerStats,
}

/// Handle to the worker thread.
///
/// The thread owns its [`Storage`] outright and closes it after the loop
/// ends.
pub struct Worker {
    handle: JoinHandle<Result<()>>,
    shared: Arc<Mutex<Shared>>,
}

impl Worker {
    /// Start a named worker thread executing messages from `receiver`
    /// against `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<R>(storage: Storage, receiver: R, thread_name: &str) -> Result<Self>
    where
        R: MessageReceiver + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared {
            state: WorkerState::Idle,
            stats: WorkerStats::default(),
        }));
        let loop_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let mut storage = storage;
                run_loop(&mut storage, &receiver, &loop_shared);
                storage.close()
            })
            .map_err(|e| StoreError::with_context("failed to spawn store worker thread", e))?;

        info!(thread = thread_name, "store worker started");
        Ok(Self { handle, shared })
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    /// Snapshot of the running totals.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.shared.lock().stats
    }

    /// Wait for the thread to finish.
    ///
    /// Only returns once the loop has seen `Quit` or lost its channel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WorkerPanicked`] if the thread panicked, or the
    /// error from closing the worker's connection.
    pub fn join(self) -> Result<WorkerStats> {
        let closed = self.handle.join().map_err(|_| StoreError::WorkerPanicked)?;
        let stats = self.shared.lock().stats;
        closed?;
        debug!(?stats, "store worker joined");
        Ok(stats)
    }
}

fn run_loop<R: MessageReceiver>(storage: &mut Storage, receiver: &R, shared: &Mutex<Shared>) {
    let mut stats = WorkerStats::default();
    loop {
        let message = match receiver.recv() {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "store worker lost its channel; stopping");
                break;
            }
        };

        shared.lock().state = WorkerState::Executing;
        let outcome = storage.execute(message, &mut stats);

        let mut guard = shared.lock();
        guard.stats = stats;
        if outcome == ExecOutcome::Stop {
            trace!("quit received");
            break;
        }
        guard.state = WorkerState::Idle;
    }
    shared.lock().state = WorkerState::Stopped;
    info!(
        messages = stats.messages,
        failed = stats.failed,
        "store worker stopped"
    );
}
