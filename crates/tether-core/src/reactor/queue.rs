//! Deferred task queue.
//!
//! All reactor-owned state is mutated from tasks popped off this queue, one
//! at a time, on the reactor thread. Producers on other threads push through
//! a [`Deferrer`]; if the reactor is blocked in `poll` the push writes a
//! single byte to the self-pipe so the wait returns.

use super::{lock, Reactor};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A unit of work executed on the reactor thread.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

pub(crate) struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    wake_tx: UnixStream,
    /// Set while the reactor is (about to be) blocked in `poll`.
    polling: AtomicBool,
    /// Set once a wake byte is in flight for the current wait.
    woken: AtomicBool,
}

impl TaskQueue {
    /// Create a queue and the read end of its self-pipe.
    pub(crate) fn new() -> io::Result<(Arc<Self>, UnixStream)> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;
        let queue = Arc::new(Self {
            tasks: Mutex::new(VecDeque::new()),
            wake_tx,
            polling: AtomicBool::new(false),
            woken: AtomicBool::new(false),
        });
        Ok((queue, wake_rx))
    }

    pub(crate) fn push(&self, task: Task) {
        lock(&self.tasks).push_back(task);
        if self.polling.load(Ordering::SeqCst) && !self.woken.swap(true, Ordering::SeqCst) {
            // A full pipe already guarantees a wakeup.
            let _ = (&self.wake_tx).write(&[1]);
        }
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        lock(&self.tasks).pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    /// Announce that the reactor is about to block. Returns `false` when
    /// tasks are already pending and the wait should not block.
    pub(crate) fn enter_poll(&self) -> bool {
        self.polling.store(true, Ordering::SeqCst);
        self.is_empty()
    }

    pub(crate) fn leave_poll(&self) {
        self.polling.store(false, Ordering::SeqCst);
        self.woken.store(false, Ordering::SeqCst);
    }

    /// Drop every pending task without running it.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<Task> = lock(&self.tasks).drain(..).collect();
        drained.len()
    }
}

/// Thread-safe handle for scheduling work on the reactor thread.
#[derive(Clone)]
pub struct Deferrer {
    pub(crate) queue: Arc<TaskQueue>,
}

impl Deferrer {
    /// Schedule `task` to run on the reactor thread.
    ///
    /// Tasks pushed from the same thread run in push order.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.queue.push(Box::new(task));
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if both handles feed the same queue.
    pub fn same_queue(&self, other: &Deferrer) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

impl std::fmt::Debug for Deferrer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferrer")
            .field("pending", &self.queue.len())
            .finish()
    }
}
