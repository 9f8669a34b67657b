//! The one-shot `Created → Running → Stopped` state machine of an [`Informer`](crate::Informer)
use parking_lot::Mutex;
use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};
use tokio::{sync::oneshot, task::JoinHandle};

/// Where an informer is in its lifetime
///
/// Transitions only ever move forward: an informer cannot be restarted once stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed, the reflector loop has not been started
    Created,
    /// The reflector loop has been started and not yet asked to stop
    Running,
    /// Stopped; no further background activity takes place
    Stopped,
}

impl LifecycleState {
    const fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Created => 0,
            LifecycleState::Running => 1,
            LifecycleState::Stopped => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Created,
            1 => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        })
    }
}

/// The running reflector task, and the way to ask it to finish
#[derive(Debug)]
pub(crate) struct ReflectorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ReflectorHandle {
    pub(crate) fn new(shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Ask the task to finish, returning the handle to await it
    pub(crate) fn signal(self) -> JoinHandle<()> {
        // The task may already be gone, in which case there is nobody to tell
        let _ = self.shutdown.send(());
        self.task
    }

    /// Whether the task has already ended, on its own or otherwise
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the task to finish, and cancel it at its next suspension point regardless
    pub(crate) fn abort(self) {
        self.signal().abort();
    }
}

/// Atomic lifecycle state plus ownership of the reflector task
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    handle: Mutex<Option<ReflectorHandle>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Created.as_u8()),
            handle: Mutex::new(None),
        }
    }
}

impl Lifecycle {
    /// The current state; a started task that has ended by itself counts as `Stopped`
    pub(crate) fn state(&self) -> LifecycleState {
        match self.raw_state() {
            LifecycleState::Running
                if self.handle.lock().as_ref().is_some_and(ReflectorHandle::is_finished) =>
            {
                LifecycleState::Stopped
            }
            state => state,
        }
    }

    fn raw_state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `Created → Running` and run `spawn`, exactly once over the lifetime of `self`
    ///
    /// Returns the current state without calling `spawn` if the transition is not possible.
    pub(crate) fn start_with(&self, spawn: impl FnOnce() -> ReflectorHandle) -> Result<(), LifecycleState> {
        self.state
            .compare_exchange(
                LifecycleState::Created.as_u8(),
                LifecycleState::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(LifecycleState::from_u8)?;
        tracing::debug!("lifecycle: created -> running");

        let handle = spawn();
        let mut slot = self.handle.lock();
        // A concurrent stop between the transition and here found no task to stop
        if self.raw_state() == LifecycleState::Stopped {
            tracing::debug!("stopped while starting, aborting reflector task");
            handle.abort();
        } else {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Move to `Stopped` from any state, handing back the task if one was running
    ///
    /// Only the first call after a start receives the handle.
    pub(crate) fn stop(&self) -> Option<ReflectorHandle> {
        let previous = LifecycleState::from_u8(self.state.swap(LifecycleState::Stopped.as_u8(), Ordering::AcqRel));
        if previous != LifecycleState::Stopped {
            tracing::debug!("lifecycle: {previous} -> stopped");
        }
        self.handle.lock().take()
    }
}
