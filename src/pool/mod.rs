//! The connection pool.
//!
//! A [`Pool`] is a cheap, cloneable handle. All of the pool's state lives in a
//! single background task (the decoupler, see `engine`) which processes one
//! command, transport signal or reaper tick at a time. Every operation on the
//! handle is a message to that task, so callers never contend on a lock for the
//! pool's collections.
//!
//! Leasing returns a [`Lease`], which dereferences to the connection. Leases are
//! time-boxed: the reaper takes back leases which run past their deadline. A
//! lease must be handed back with [`Lease::release`] (or [`Pool::yield_lease`]);
//! dropping a lease does not return its connection to the pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

mod builder;
mod engine;
mod lease;
mod weakopt;

pub use self::builder::Builder;
pub use self::lease::{Lease, LeaseFuture, LeaseHandle};
pub(crate) use self::weakopt::WeakOpt;

use self::engine::LeaseTask;
use self::lease::{LeaseAttempt, LeaseState};
use crate::config::Config;
use crate::conn::{Connection, ConnectionId, TransportEvent};
use crate::listener::{ListenerId, Listeners, PoolListener};
use crate::slot::LeaseId;
use crate::task::{Completion, DeferredTask};
use crate::{BoxError, Error};

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a single lease request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        Self(REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Events which re-enter the decoupler from outside a command.
///
/// These never carry the connection type, so transport callbacks and establish
/// tokens can hold a sender without being generic over the pool.
#[derive(Debug)]
pub(crate) enum Signal {
    Transport(ConnectionId, TransportEvent),
    Established(ConnectionId, Result<(), BoxError>),
}

/// Why a connection is being handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum YieldReason {
    Released,
    Canceled(RequestId),
}

pub(crate) enum Command<C, U> {
    Start(oneshot::Sender<Result<(), Error>>),
    Stop(bool, oneshot::Sender<()>),
    Lease(LeaseTask<C, U>),
    Cancel(RequestId),
    Yield {
        connection: ConnectionId,
        lease: LeaseId,
        reason: YieldReason,
        reply: Option<oneshot::Sender<Result<(), Error>>>,
    },
    Close(ConnectionId),
    Status(oneshot::Sender<PoolStatus>),
}

impl<C, U> fmt::Debug for Command<C, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start(_) => f.write_str("Start"),
            Command::Stop(force, _) => f.debug_tuple("Stop").field(force).finish(),
            Command::Lease(task) => f.debug_tuple("Lease").field(&task.attempt().request).finish(),
            Command::Cancel(request) => f.debug_tuple("Cancel").field(request).finish(),
            Command::Yield {
                connection, lease, ..
            } => f
                .debug_struct("Yield")
                .field("connection", connection)
                .field("lease", lease)
                .finish(),
            Command::Close(id) => f.debug_tuple("Close").field(id).finish(),
            Command::Status(_) => f.write_str("Status"),
        }
    }
}

/// A snapshot of the pool's state, taken inside a decoupler turn.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStatus {
    /// Immortal connections sitting in the pool.
    pub available_immortal: usize,

    /// Ephemeral connections sitting in the pool.
    pub available_ephemeral: usize,

    /// Connections out on lease, of either class.
    pub leased: usize,

    /// Leased connections which return to the immortal class.
    pub leased_immortal: usize,

    /// Immortal connections still connecting or establishing.
    pub opening_immortal: usize,

    /// Ephemeral connections still connecting or establishing.
    pub opening_ephemeral: usize,

    /// Lease requests waiting for a connection.
    pub pending: usize,

    /// Configured number of immortal connections.
    pub immortal_count: usize,

    /// Configured cap on ephemeral connections.
    pub max_ephemeral_count: usize,

    /// The pool has begun shutting down.
    pub shutting_down: bool,

    /// The pool has closed all of its connections.
    pub stopped: bool,
}

impl PoolStatus {
    /// Immortal connections in any state: available, leased or opening.
    pub fn immortal_total(&self) -> usize {
        self.available_immortal + self.leased_immortal + self.opening_immortal
    }

    /// Ephemeral connections in any state: available, leased or opening.
    pub fn ephemeral_total(&self) -> usize {
        self.available_ephemeral + (self.leased - self.leased_immortal) + self.opening_ephemeral
    }

    /// Connections sitting in the pool, ready to lease.
    pub fn available(&self) -> usize {
        self.available_immortal + self.available_ephemeral
    }
}

/// State shared by every handle to one pool.
pub(crate) struct Shared<C, U> {
    commands: mpsc::UnboundedSender<Command<C, U>>,
    listeners: Listeners<U>,
    shutting_down: AtomicBool,
    config: Config,
}

impl<C, U> Shared<C, U> {
    pub(crate) fn send(&self, command: Command<C, U>) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Unavailable)
    }
}

pub(crate) type PoolRef<C, U> = WeakOpt<Shared<C, U>>;

/// A pool of connections to one remote endpoint.
///
/// `C` is the connection handle, and `U` is the correlation value callers attach
/// to each lease, which is echoed back in every event about that lease.
///
/// Dropping the last handle stops the pool, closing every connection.
pub struct Pool<C, U = ()> {
    shared: Arc<Shared<C, U>>,
}

impl<C, U> Clone for Pool<C, U> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C, U> fmt::Debug for Pool<C, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl<C, U> Pool<C, U>
where
    C: Connection,
    U: Clone + Send + Sync + 'static,
{
    /// Create a builder for a new pool.
    pub fn builder() -> Builder<C, U> {
        Builder::new()
    }
}

impl<C, U> Pool<C, U> {
    /// The configuration this pool was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Returns `true` once [`Pool::stop`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Register a listener for pool lifecycle events.
    pub fn add_listener<L>(&self, listener: L) -> ListenerId
    where
        L: PoolListener<U>,
    {
        self.shared.listeners.add(Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Close a connection, wherever it currently is.
    ///
    /// A closed immortal connection is replaced. A lease on the connection ends,
    /// and yielding it afterwards fails.
    pub fn close_connection(&self, id: ConnectionId) {
        if self.shared.send(Command::Close(id)).is_err() {
            tracing::trace!(%id, "pool closed, connection already gone");
        }
    }
}

impl<C, U> Pool<C, U>
where
    C: Connection,
    U: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command<C, U>>,
        listeners: Listeners<U>,
        config: Config,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                commands,
                listeners,
                shutting_down: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> PoolRef<C, U> {
        WeakOpt::downgrade(&self.shared)
    }

    /// Open the immortal connections and start serving leases.
    ///
    /// Resolves once the `Started` event has fired. Connections which fail to
    /// open are reported to the pool exception handler and do not fail startup.
    pub async fn start(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.shared.send(Command::Start(tx))?;
        rx.await.map_err(|_| Error::Unavailable)?
    }

    /// Stop the pool.
    ///
    /// New lease requests fail from the moment this is called. Without `force`,
    /// the pool waits for every outstanding lease to be yielded (or expired) before
    /// closing its connections. Resolves once the `Stopped` event has fired.
    pub async fn stop(&self, force: bool) -> Result<(), Error> {
        self.shared.shutting_down.store(true, Ordering::Release);
        let (tx, rx) = oneshot::channel();
        self.shared.send(Command::Stop(force, tx))?;
        rx.await.map_err(|_| Error::Unavailable)
    }

    /// Request a lease, returning a cancellable future for it.
    ///
    /// The request is queued immediately, whether or not the future is polled.
    /// Dropping the future cancels the request.
    pub fn lease_async(&self, duration: Duration, correlation: U) -> LeaseFuture<C, U> {
        let (completion, handle) = Completion::channel();
        match self.submit(duration, correlation, completion) {
            Ok(lease) => LeaseFuture::new(lease, handle),
            Err((error, _)) => LeaseFuture::rejected(error),
        }
    }

    /// Request a lease, delivering the result to `listener` exactly once.
    ///
    /// If the pool is shutting down, the listener is called before this returns.
    pub fn lease_with_listener<F>(
        &self,
        duration: Duration,
        correlation: U,
        listener: F,
    ) -> LeaseHandle<C, U>
    where
        F: FnOnce(Result<Lease<C, U>, Error>) + Send + 'static,
    {
        match self.submit(duration, correlation, Completion::listener(listener)) {
            Ok(handle) => handle,
            Err((error, completion)) => {
                let _ = completion.resolve(Err(error));
                LeaseHandle::detached()
            }
        }
    }

    /// Lease a connection, waiting until one is available.
    pub async fn lease(&self, duration: Duration, correlation: U) -> Result<Lease<C, U>, Error> {
        self.lease_async(duration, correlation).await
    }

    /// Lease a connection, blocking the current thread until one is available.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_lease(&self, duration: Duration, correlation: U) -> Result<Lease<C, U>, Error> {
        self.lease_async(duration, correlation).blocking_wait()
    }

    /// Return a leased connection to the pool.
    ///
    /// Fails with [`Error::ProtocolState`] if the lease is no longer current, for
    /// example because the reaper already expired it.
    pub async fn yield_lease(&self, lease: Lease<C, U>) -> Result<(), Error> {
        let (command, reply) = lease.into_yield();
        self.shared.send(command)?;
        reply.await.map_err(|_| Error::Unavailable)?
    }

    /// Take a consistent snapshot of the pool's state.
    pub async fn status(&self) -> Result<PoolStatus, Error> {
        let (tx, rx) = oneshot::channel();
        self.shared.send(Command::Status(tx))?;
        rx.await.map_err(|_| Error::Unavailable)
    }

    fn submit(
        &self,
        duration: Duration,
        correlation: U,
        completion: Completion<Lease<C, U>, Error>,
    ) -> Result<LeaseHandle<C, U>, (Error, Completion<Lease<C, U>, Error>)> {
        if self.is_shutting_down() {
            return Err((Error::ShutdownRejected, completion));
        }

        let request = RequestId::next();
        let state = Arc::new(LeaseState::default());
        let attempt = LeaseAttempt::new(request, duration, correlation, state.clone());
        let task = DeferredTask::new(attempt, completion);

        if let Err(mpsc::error::SendError(Command::Lease(task))) =
            self.shared.commands.send(Command::Lease(task))
        {
            return Err((Error::Unavailable, task.into_completion()));
        }

        Ok(LeaseHandle::new(request, state, self.downgrade()))
    }
}
