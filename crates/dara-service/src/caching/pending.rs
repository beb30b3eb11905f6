use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::watch;

use super::TaskError;

type Outcome<T> = Option<Result<T, TaskError>>;

/// A placeholder for a value that is still being computed.
///
/// A `PendingValue` resolves exactly once, either to a value or to a [`TaskError`]. Any number of
/// clones can [`wait`](Self::wait) on it concurrently, and all of them observe the same outcome.
/// Waiting on an already resolved value returns immediately.
pub struct PendingValue<T> {
    outcome: Arc<watch::Sender<Outcome<T>>>,
}

impl<T> Clone for PendingValue<T> {
    fn clone(&self) -> Self {
        Self {
            outcome: Arc::clone(&self.outcome),
        }
    }
}

impl<T> Default for PendingValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingValue<T> {
    pub fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            outcome: Arc::new(outcome),
        }
    }

    /// Resolves with a value, waking all waiters.
    ///
    /// Returns `false` if this was already resolved, in which case nothing changes.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Resolves with an error, waking all waiters.
    ///
    /// Returns `false` if this was already resolved, in which case nothing changes.
    pub fn fail(&self, error: TaskError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, result: Result<T, TaskError>) -> bool {
        let mut result = Some(result);
        let settled = self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = result.take();
            true
        });

        if !settled {
            let discarded = match result {
                Some(Ok(_)) => "value",
                Some(Err(_)) => "error",
                None => "outcome",
            };
            tracing::warn!(discarded, "pending value was already resolved");
        }
        settled
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Returns `true` if both handles refer to the same placeholder.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.outcome, &other.outcome)
    }
}

impl<T: Clone> PendingValue<T> {
    /// Returns the outcome if this is already resolved.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        self.outcome.borrow().clone()
    }

    /// Waits until this is resolved and returns the outcome.
    pub async fn wait(&self) -> Result<T, TaskError> {
        let mut receiver = self.outcome.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(TaskError::Cancelled)),
            // the sender lives in `self`, so it cannot be dropped while we wait
            Err(_) => Err(TaskError::Cancelled),
        }
    }
}

impl<T> fmt::Debug for PendingValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.outcome.borrow() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("PendingValue").field("state", &state).finish()
    }
}

/// Invoked when the last subscriber of a [`PendingTask`] cancels it.
pub type CancelHook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct TaskInner<T> {
    task_id: String,
    result: PendingValue<T>,
    subscribers: AtomicUsize,
    notify_channels: Mutex<Vec<String>>,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// A placeholder for the result of a task running elsewhere, typically on the
/// [`TaskPool`](crate::pool::TaskPool).
///
/// Every caller that joins an in-flight task registers as a subscriber. Cancellation is reference
/// counted: the task is only cancelled once its last subscriber cancels, at which point the
/// cancel hook runs and all waiters receive [`TaskError::Cancelled`].
pub struct PendingTask<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for PendingTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PendingTask<T> {
    /// Creates a task with a single subscriber.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                task_id: task_id.into(),
                result: PendingValue::new(),
                subscribers: AtomicUsize::new(1),
                notify_channels: Mutex::new(Vec::new()),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// Creates a task which runs `hook` when it is cancelled.
    pub fn with_cancel_hook(task_id: impl Into<String>, hook: CancelHook) -> Self {
        let task = Self::new(task_id);
        task.set_cancel_hook(hook);
        task
    }

    /// Replaces the hook run on cancellation.
    pub fn set_cancel_hook(&self, hook: CancelHook) {
        *self.inner.on_cancel.lock().unwrap() = Some(hook);
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn subscribers(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }

    pub fn add_subscriber(&self) {
        self.inner.subscribers.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops a subscriber without cancelling. The count never drops below one.
    pub fn remove_subscriber(&self) {
        let _ = self
            .inner
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 1).then(|| n - 1)
            });
    }

    pub fn notify_channels(&self) -> Vec<String> {
        self.inner.notify_channels.lock().unwrap().clone()
    }

    /// Registers a channel to be notified once the task completes.
    pub fn add_notify_channel(&self, channel: impl Into<String>) {
        let channel = channel.into();
        let mut channels = self.inner.notify_channels.lock().unwrap();
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }

    pub fn resolve(&self, value: T) -> bool {
        self.inner.result.resolve(value)
    }

    pub fn fail(&self, error: TaskError) -> bool {
        self.inner.result.fail(error)
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.result.is_resolved()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Cancels the task on behalf of one subscriber.
    ///
    /// While other subscribers remain, this only drops the caller's subscription and returns
    /// `false`. The last subscriber runs the cancel hook and fails the task with
    /// [`TaskError::Cancelled`], returning `true`. Cancelling a task that already completed
    /// runs the hook but does not change its outcome.
    pub async fn cancel(&self) -> bool {
        let shared = self
            .inner
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok();
        if shared {
            tracing::debug!(
                task_id = self.task_id(),
                "task still has subscribers, dropping subscription"
            );
            return false;
        }

        let hook = self.inner.on_cancel.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await;
        }
        if !self.is_resolved() {
            self.fail(TaskError::Cancelled);
        }
        tracing::debug!(task_id = self.task_id(), "task cancelled");
        true
    }
}

impl<T: Clone> PendingTask<T> {
    /// Waits for the task to complete and returns its outcome.
    pub async fn run(&self) -> Result<T, TaskError> {
        self.inner.result.wait().await
    }

    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        self.inner.result.try_get()
    }
}

impl<T> fmt::Debug for PendingTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("task_id", &self.inner.task_id)
            .field("subscribers", &self.subscribers())
            .field("result", &self.inner.result)
            .finish()
    }
}
