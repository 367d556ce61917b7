//! Executors decouple application callbacks from transport threads.

use std::sync::Arc;

use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};

/// Deferred unit of work.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Runs actions off the calling thread.
///
/// Implementations must run actions in the order they were added.
pub trait Executor: Send + Sync {
    fn add_action(&self, action: Action);
}

pub type ExecutorPtr = Arc<dyn Executor>;

/// Run `action` on the executor if one is configured, inline otherwise.
pub fn run_or_inline(executor: Option<&ExecutorPtr>, action: impl FnOnce() + Send + 'static) {
    match executor {
        Some(executor) => executor.add_action(Box::new(action)),
        None => action(),
    }
}

/// FIFO executor backed by a single tokio task.
pub struct TokioExecutor {
    sender: mpsc::UnboundedSender<Action>,
    worker: JoinHandle<()>,
}

impl TokioExecutor {
    /// Start the worker on the given runtime.
    #[must_use]
    pub fn new(handle: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Action>();
        let worker = handle.spawn(async move {
            while let Some(action) = receiver.recv().await {
                action();
            }
        });
        Self { sender, worker }
    }

    /// Start the worker on the current runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(&Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn add_action(&self, action: Action) {
        if self.sender.send(action).is_err() {
            tracing::warn!("executor stopped, dropping action");
        }
    }
}

impl Drop for TokioExecutor {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
