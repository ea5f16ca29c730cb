//! Cancellable background task abstraction.
//!
//! Every background loop in the pipeline (downloader, decoder task,
//! readiness timer, playback feeder, uploader) follows the same shutdown
//! protocol: the owner flips a stop flag, wakes any condition-variable
//! waiters on the owning object, and joins the thread. [`TaskHandle`]
//! packages that protocol once so no loop re-implements it.
//!
//! The task body receives a [`StopFlag`] and must check it at every safe
//! suspension point; the wake closure supplied at spawn time is expected to
//! broadcast on whichever condvar the body blocks on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::error::{Error, Result};

/// Shared stop flag checked by task loops at each suspension point.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    /// True once the owning task has been asked to stop
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a cancellable background thread.
///
/// `close()` sets the stop flag, invokes the wake closure (broadcast-style
/// notify on the owner's condvar) and blocks until the thread has exited.
/// Closing twice is a no-op; dropping an open handle closes it.
pub struct TaskHandle {
    name: String,
    stop: StopFlag,
    wake: Arc<dyn Fn() + Send + Sync>,
    thread: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn a named task. The body runs until it returns or observes the
    /// stop flag; `wake` must rouse the body from any blocking wait.
    pub fn spawn<F>(
        name: &str,
        wake: impl Fn() + Send + Sync + 'static,
        body: F,
    ) -> Result<TaskHandle>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = StopFlag::new();
        let stop_for_body = stop.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop_for_body))
            .map_err(Error::Io)?;
        Ok(TaskHandle {
            name: name.to_string(),
            stop,
            wake: Arc::new(wake),
            thread: Some(thread),
        })
    }

    /// Stop flag shared with the task body
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Signal the task to stop and join it. Must not be called while
    /// holding the lock the task body blocks on.
    pub fn close(&mut self) {
        self.stop.set();
        (self.wake)();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("background task '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.close();
    }
}
