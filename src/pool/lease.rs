//! Leases and lease requests, as seen by the caller.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{Command, PoolRef, RequestId, YieldReason};
use crate::conn::{ConnectionClass, ConnectionId};
use crate::notify::{self, Expired};
use crate::slot::{LeaseId, LeasedSlot};
use crate::task::{TaskError, TaskHandle};
use crate::Error;

const PENDING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELED: u8 = 2;

/// Tracks whether a lease request was granted or canceled first.
///
/// The caller cancels and the decoupler grants; whichever moves the state out of
/// `PENDING` first wins.
#[derive(Debug, Default)]
pub(crate) struct LeaseState(AtomicU8);

impl LeaseState {
    pub(crate) fn cancel(&self) -> bool {
        self.transition(CANCELED)
    }

    pub(crate) fn grant(&self) -> bool {
        self.transition(GRANTED)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELED
    }

    fn is_granted(&self) -> bool {
        self.0.load(Ordering::Acquire) == GRANTED
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The attempt logic for one lease request, run by the decoupler.
#[derive(Debug)]
pub(crate) struct LeaseAttempt<U> {
    pub(crate) request: RequestId,
    pub(crate) duration: Duration,
    pub(crate) correlation: U,
    pub(crate) state: Arc<LeaseState>,
}

impl<U> LeaseAttempt<U> {
    pub(crate) fn new(
        request: RequestId,
        duration: Duration,
        correlation: U,
        state: Arc<LeaseState>,
    ) -> Self {
        Self {
            request,
            duration,
            correlation,
            state,
        }
    }
}

/// A connection on loan from the pool.
///
/// Dereferences to the connection. Hand the lease back with [`Lease::release`];
/// dropping it keeps the connection out of the pool until the reaper expires the
/// lease.
pub struct Lease<C, U = ()> {
    connection: C,
    id: ConnectionId,
    lease: LeaseId,
    request: RequestId,
    origin: ConnectionClass,
    deadline: Option<Instant>,
    correlation: U,
    expiry: notify::Receiver,
    pool: PoolRef<C, U>,
}

impl<C, U: fmt::Debug> fmt::Debug for Lease<C, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("lease", &self.lease)
            .field("request", &self.request)
            .field("deadline", &self.deadline)
            .field("correlation", &self.correlation)
            .finish_non_exhaustive()
    }
}

impl<C, U> Deref for Lease<C, U> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C: Clone, U: Clone> Lease<C, U> {
    pub(crate) fn new(
        slot: &LeasedSlot<C, U>,
        request: RequestId,
        expiry: notify::Receiver,
        pool: PoolRef<C, U>,
    ) -> Self {
        Self {
            connection: slot.connection().clone(),
            id: slot.id(),
            lease: slot.lease(),
            request,
            origin: slot.origin(),
            deadline: slot.deadline(),
            correlation: slot.correlation().clone(),
            expiry,
            pool,
        }
    }
}

impl<C, U> Lease<C, U> {
    /// The leased connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// The leased connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// This lease's identifier.
    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    /// The request which was granted this lease.
    pub fn request(&self) -> RequestId {
        self.request
    }

    /// The class the connection returns to when yielded.
    pub fn origin(&self) -> ConnectionClass {
        self.origin
    }

    /// When the reaper may take this lease back. `None` for leases too long to represent.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The correlation value supplied with the request.
    pub fn correlation(&self) -> &U {
        &self.correlation
    }

    /// Returns `true` if the pool has already expired this lease.
    pub fn is_expired(&self) -> bool {
        self.expiry.is_expired()
    }

    /// Resolves when the pool is done with this lease.
    ///
    /// Resolves to `true` if the reaper expired the lease, or `false` if the lease
    /// ended any other way.
    pub fn expired(&self) -> Expired {
        self.expiry.clone().into_future()
    }

    /// Return the connection to the pool.
    ///
    /// Fails with [`Error::ProtocolState`] if this lease is no longer current, and
    /// with [`Error::Unavailable`] if the pool has gone away.
    pub async fn release(self) -> Result<(), Error> {
        let pool = self.pool.upgrade().ok_or(Error::Unavailable)?;
        let (command, reply) = self.into_yield();
        pool.send(command)?;
        drop(pool);
        reply.await.map_err(|_| Error::Unavailable)?
    }

    pub(crate) fn into_yield(self) -> (Command<C, U>, oneshot::Receiver<Result<(), Error>>) {
        let (tx, rx) = oneshot::channel();
        let command = Command::Yield {
            connection: self.id,
            lease: self.lease,
            reason: YieldReason::Released,
            reply: Some(tx),
        };
        (command, rx)
    }

    /// Hand the connection back as part of canceling its request.
    fn cancel(self) {
        let command = Command::Yield {
            connection: self.id,
            lease: self.lease,
            reason: YieldReason::Canceled(self.request),
            reply: None,
        };

        match self.pool.upgrade() {
            Some(pool) if pool.send(command).is_ok() => {}
            _ => tracing::trace!(id=%self.id, "pool closed, dropping canceled lease"),
        }
    }
}

/// A handle to a queued lease request, which can cancel it.
#[derive(Debug)]
pub struct LeaseHandle<C, U = ()> {
    request: Option<RequestId>,
    state: Arc<LeaseState>,
    pool: PoolRef<C, U>,
}

impl<C, U> LeaseHandle<C, U> {
    pub(crate) fn new(request: RequestId, state: Arc<LeaseState>, pool: PoolRef<C, U>) -> Self {
        Self {
            request: Some(request),
            state,
            pool,
        }
    }

    /// A handle for a request which never reached the pool.
    pub(crate) fn detached() -> Self {
        Self {
            request: None,
            state: Arc::default(),
            pool: PoolRef::none(),
        }
    }

    /// The request this handle controls, if it reached the pool.
    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    /// Cancel the request if it has not been granted yet.
    ///
    /// Returns `false` if the request was already granted, canceled, or never
    /// reached the pool.
    pub fn cancel(&self) -> bool {
        let Some(request) = self.request else {
            return false;
        };

        if !self.state.cancel() {
            return false;
        }

        tracing::trace!(%request, "canceling lease request");
        if let Some(pool) = self.pool.upgrade() {
            let _ = pool.send(Command::Cancel(request));
        }
        true
    }
}

/// A lease request in flight.
///
/// Resolves to the [`Lease`] once a connection is granted. Dropping the future
/// before it resolves cancels the request; a connection granted in the meantime
/// is handed straight back to the pool.
#[derive(Debug)]
pub struct LeaseFuture<C, U = ()> {
    handle: LeaseHandle<C, U>,
    task: TaskHandle<Lease<C, U>, Error>,
    canceled: bool,
}

impl<C, U> LeaseFuture<C, U> {
    pub(crate) fn new(handle: LeaseHandle<C, U>, task: TaskHandle<Lease<C, U>, Error>) -> Self {
        Self {
            handle,
            task,
            canceled: false,
        }
    }

    pub(crate) fn rejected(error: Error) -> Self {
        Self::new(LeaseHandle::detached(), TaskHandle::ready(Err(error)))
    }

    /// The request this future is waiting on, if it reached the pool.
    pub fn request(&self) -> Option<RequestId> {
        self.handle.request()
    }

    /// Cancel the request.
    ///
    /// Before a grant, the request is withdrawn and this future resolves to
    /// [`Error::Canceled`]. If a connection was already granted but not yet
    /// taken from this future, it is returned to the pool and reported as
    /// canceled. Returns `false` if there was nothing left to cancel.
    pub fn cancel(&mut self) -> bool {
        if self.task.is_terminated() || self.canceled {
            return false;
        }

        if self.handle.cancel() {
            self.canceled = true;
            return true;
        }

        if !self.handle.state.is_granted() {
            return false;
        }

        // Granted, but not yet taken by the caller.
        self.canceled = true;
        if let Some(Ok(lease)) = self.task.close_and_take() {
            lease.cancel();
        }
        true
    }

    /// Wait for the lease for at most `timeout`.
    ///
    /// A timeout leaves the request queued: wait again, or cancel it.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Lease<C, U>, Error> {
        let result = self.task.wait_timeout(timeout).await;
        self.map(result)
    }

    /// Block the current thread until the lease is granted or fails.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_wait(mut self) -> Result<Lease<C, U>, Error> {
        let result = self.task.blocking_wait();
        self.map(result)
    }

    fn map(&self, result: Result<Lease<C, U>, TaskError<Error>>) -> Result<Lease<C, U>, Error> {
        match result {
            Ok(lease) => Ok(lease),
            Err(TaskError::Failed(error)) => Err(error),
            Err(TaskError::TimedOut) => Err(Error::Timeout),
            Err(TaskError::Abandoned) if self.canceled => Err(Error::Canceled),
            Err(TaskError::Abandoned) => Err(Error::Unavailable),
        }
    }
}

impl<C, U> Future for LeaseFuture<C, U> {
    type Output = Result<Lease<C, U>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = std::task::ready!(Pin::new(&mut self.task).poll(cx));
        Poll::Ready(self.map(result))
    }
}

impl<C, U> Drop for LeaseFuture<C, U> {
    fn drop(&mut self) {
        self.cancel();
    }
}
