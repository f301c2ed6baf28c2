//! Deferred tasks: units of work which either finish, fail, or ask to be tried again later.
//!
//! The pool uses deferred tasks for lease requests. A request which cannot be
//! granted right away is put back into a [`TaskQueue`], either at the front (try
//! again as soon as something changes) or at the back (wait behind older
//! requests), and re-attempted when the pool wakes it.
//!
//! A task carries its own attempt logic (an [`Attempt`] value) and a
//! [`Completion`] which delivers the final result exactly once. The waiting side
//! holds a [`TaskHandle`], which can be awaited, awaited with a timeout, or
//! waited on from a synchronous thread.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

/// Where a task asking for a retry should be placed in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Retry before anything else waiting in the queue.
    Front,

    /// Wait behind everything already in the queue.
    Back,
}

/// The result of one attempt at a task.
#[derive(Debug)]
pub enum Outcome<V, E> {
    /// The task finished with a value.
    Complete(V),

    /// The task failed, and will not be attempted again.
    Fail(E),

    /// The task could not finish yet, and should be tried again later.
    Retry(Requeue),
}

/// The work carried by a deferred task.
///
/// `first` is `true` only for the very first attempt.
pub trait Attempt<Ctx: ?Sized> {
    /// Value produced when the task completes.
    type Output;

    /// Error produced when the task fails.
    type Error;

    /// Run one attempt against the executor's context.
    fn attempt(&mut self, ctx: &mut Ctx, first: bool) -> Outcome<Self::Output, Self::Error>;
}

/// Delivers a task's result to whoever is waiting for it.
pub enum Completion<V, E> {
    /// Send the result over a channel to a [`TaskHandle`].
    Channel(oneshot::Sender<Result<V, E>>),

    /// Call a listener with the result.
    Listener(Box<dyn FnOnce(Result<V, E>) + Send>),
}

impl<V, E> fmt::Debug for Completion<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Channel(_) => f.debug_tuple("Completion::Channel").finish(),
            Completion::Listener(_) => f.debug_tuple("Completion::Listener").finish(),
        }
    }
}

impl<V, E> Completion<V, E> {
    /// Create a channel completion and the handle which receives its result.
    pub fn channel() -> (Self, TaskHandle<V, E>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Channel(tx), TaskHandle::new(rx))
    }

    /// Create a completion which calls `listener` with the result.
    pub fn listener<F>(listener: F) -> Self
    where
        F: FnOnce(Result<V, E>) + Send + 'static,
    {
        Completion::Listener(Box::new(listener))
    }

    /// Returns `true` if nobody is waiting for the result any more.
    pub fn is_closed(&self) -> bool {
        match self {
            Completion::Channel(tx) => tx.is_closed(),
            Completion::Listener(_) => false,
        }
    }

    /// Deliver the result. If nobody is waiting, the result is handed back.
    pub fn resolve(self, result: Result<V, E>) -> Result<(), Result<V, E>> {
        match self {
            Completion::Channel(tx) => tx.send(result),
            Completion::Listener(listener) => {
                listener(result);
                Ok(())
            }
        }
    }
}

/// What happened when a deferred task was run.
#[derive(Debug)]
pub enum Step<T, V, E> {
    /// The task wants another attempt, placed as indicated.
    Deferred(T, Requeue),

    /// The task finished, and its result was delivered.
    Settled,

    /// The task finished, but nobody was waiting for the result.
    Undelivered(Result<V, E>),
}

/// A retryable unit of work paired with the sink for its result.
pub struct DeferredTask<A, V, E> {
    attempt: A,
    first: bool,
    completion: Completion<V, E>,
}

impl<A: fmt::Debug, V, E> fmt::Debug for DeferredTask<A, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("attempt", &self.attempt)
            .field("first", &self.first)
            .finish()
    }
}

impl<A, V, E> DeferredTask<A, V, E> {
    /// Create a new task which has not yet been attempted.
    pub fn new(attempt: A, completion: Completion<V, E>) -> Self {
        Self {
            attempt,
            first: true,
            completion,
        }
    }

    /// The work this task carries.
    pub fn attempt(&self) -> &A {
        &self.attempt
    }

    /// Returns `true` until the task has been attempted once.
    pub fn is_first_attempt(&self) -> bool {
        self.first
    }

    /// Returns `true` if nobody is waiting for this task's result.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    /// Run one attempt.
    pub fn run<Ctx>(mut self, ctx: &mut Ctx) -> Step<Self, V, E>
    where
        Ctx: ?Sized,
        A: Attempt<Ctx, Output = V, Error = E>,
    {
        let first = std::mem::replace(&mut self.first, false);
        match self.attempt.attempt(ctx, first) {
            Outcome::Complete(value) => self.settle(Ok(value)),
            Outcome::Fail(error) => self.settle(Err(error)),
            Outcome::Retry(requeue) => Step::Deferred(self, requeue),
        }
    }

    /// Give up on the task, returning the sink for its result.
    pub fn into_completion(self) -> Completion<V, E> {
        self.completion
    }

    /// Fail the task without another attempt.
    pub fn fail(self, error: E) -> Step<Self, V, E> {
        self.settle(Err(error))
    }

    fn settle(self, result: Result<V, E>) -> Step<Self, V, E> {
        match self.completion.resolve(result) {
            Ok(()) => Step::Settled,
            Err(result) => Step::Undelivered(result),
        }
    }
}

/// A FIFO of tasks waiting for another attempt.
#[derive(Debug)]
pub struct TaskQueue<T> {
    inner: VecDeque<T>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }
}

impl<T> TaskQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a task back in the queue.
    pub fn defer(&mut self, task: T, requeue: Requeue) {
        match requeue {
            Requeue::Front => self.inner.push_front(task),
            Requeue::Back => self.inner.push_back(task),
        }
    }

    /// Take the task at the head of the queue.
    pub fn pop_front(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    /// Remove the first task matching `predicate`.
    pub fn remove_where<F>(&mut self, predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.inner.iter().position(predicate)?;
        self.inner.remove(index)
    }

    /// Take every task, in queue order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..)
    }

    /// Number of tasks waiting.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Why a [`TaskHandle`] did not produce a value.
#[derive(Debug, PartialEq, Eq)]
pub enum TaskError<E> {
    /// The task failed.
    Failed(E),

    /// The wait timed out. The task itself is still pending.
    TimedOut,

    /// The task was dropped without producing a result.
    Abandoned,
}

/// The waiting side of a deferred task.
#[derive(Debug)]
pub struct TaskHandle<V, E> {
    rx: Option<oneshot::Receiver<Result<V, E>>>,
}

impl<V, E> TaskHandle<V, E> {
    fn new(rx: oneshot::Receiver<Result<V, E>>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A handle which resolves immediately with `result`.
    pub fn ready(result: Result<V, E>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx)
    }

    /// Returns `true` once the handle has produced its result.
    pub fn is_terminated(&self) -> bool {
        self.rx.is_none()
    }

    /// Wait for the result for at most `timeout`.
    ///
    /// On [`TaskError::TimedOut`] the task is left pending, and the handle can be
    /// waited on again.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<V, TaskError<E>> {
        match tokio::time::timeout(timeout, &mut *self).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::TimedOut),
        }
    }

    /// Block the current thread until the result arrives.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_wait(&mut self) -> Result<V, TaskError<E>> {
        match self.rx.take() {
            Some(rx) => flatten(rx.blocking_recv()),
            None => Err(TaskError::Abandoned),
        }
    }

    /// Stop waiting, and take the result if one was already delivered.
    pub fn close_and_take(&mut self) -> Option<Result<V, E>> {
        let mut rx = self.rx.take()?;
        rx.close();
        rx.try_recv().ok()
    }
}

fn flatten<V, E>(received: Result<Result<V, E>, oneshot::error::RecvError>) -> Result<V, TaskError<E>> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(TaskError::Failed(error)),
        Err(_) => Err(TaskError::Abandoned),
    }
}

impl<V, E> Future for TaskHandle<V, E> {
    type Output = Result<V, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(TaskError::Abandoned));
        };

        let received = std::task::ready!(Pin::new(rx).poll(cx));
        self.rx = None;
        Poll::Ready(flatten(received))
    }
}
