//! Lifecycle events and the multicast bus which delivers them.
//!
//! Events are fired by the pool's decoupler, inside the turn which caused them,
//! in the order the transitions happened. Listeners are called synchronously
//! and must not block.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::conn::{ConnectionClass, ConnectionId};
use crate::pool::RequestId;
use crate::slot::LeaseId;

/// A pool lifecycle event.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum PoolEvent<U> {
    /// The pool finished opening its immortal connections.
    Started,

    /// The pool closed all of its connections.
    Stopped,

    /// A caller asked for a lease.
    LeaseRequested {
        /// The request.
        request: RequestId,
        /// Requested lease duration.
        duration: Duration,
        /// Caller-supplied correlation value.
        correlation: U,
    },

    /// A connection was handed out.
    LeaseGranted {
        /// The request which was granted.
        request: RequestId,
        /// The new lease.
        lease: LeaseId,
        /// The leased connection.
        connection: ConnectionId,
        /// Caller-supplied correlation value.
        correlation: U,
    },

    /// A leased connection came back to the pool.
    LeaseYielded {
        /// The lease which ended.
        lease: LeaseId,
        /// The returned connection.
        connection: ConnectionId,
        /// Caller-supplied correlation value.
        correlation: U,
    },

    /// A lease ran past its deadline and was taken back.
    LeaseExpired {
        /// The lease which expired.
        lease: LeaseId,
        /// The connection, which is about to close.
        connection: ConnectionId,
        /// Caller-supplied correlation value.
        correlation: U,
    },

    /// A lease request was canceled.
    LeaseCanceled {
        /// The canceled request.
        request: RequestId,
        /// The connection which had already been granted, if any.
        connection: Option<ConnectionId>,
        /// Caller-supplied correlation value.
        correlation: U,
    },

    /// A new connection joined the pool.
    ConnectionCreated {
        /// The new connection.
        connection: ConnectionId,
        /// Its class.
        class: ConnectionClass,
    },

    /// A connection was closed and removed from the pool.
    ConnectionClosed {
        /// The closed connection.
        connection: ConnectionId,
        /// Its class.
        class: ConnectionClass,
    },

    /// An idle ephemeral connection aged out.
    EphemeralReaped {
        /// The reaped connection.
        connection: ConnectionId,
    },
}

/// The kind of a [`PoolEvent`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// See [`PoolEvent::Started`].
    Started,
    /// See [`PoolEvent::Stopped`].
    Stopped,
    /// See [`PoolEvent::LeaseRequested`].
    LeaseRequested,
    /// See [`PoolEvent::LeaseGranted`].
    LeaseGranted,
    /// See [`PoolEvent::LeaseYielded`].
    LeaseYielded,
    /// See [`PoolEvent::LeaseExpired`].
    LeaseExpired,
    /// See [`PoolEvent::LeaseCanceled`].
    LeaseCanceled,
    /// See [`PoolEvent::ConnectionCreated`].
    ConnectionCreated,
    /// See [`PoolEvent::ConnectionClosed`].
    ConnectionClosed,
    /// See [`PoolEvent::EphemeralReaped`].
    EphemeralReaped,
}

impl<U> PoolEvent<U> {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            PoolEvent::Started => EventKind::Started,
            PoolEvent::Stopped => EventKind::Stopped,
            PoolEvent::LeaseRequested { .. } => EventKind::LeaseRequested,
            PoolEvent::LeaseGranted { .. } => EventKind::LeaseGranted,
            PoolEvent::LeaseYielded { .. } => EventKind::LeaseYielded,
            PoolEvent::LeaseExpired { .. } => EventKind::LeaseExpired,
            PoolEvent::LeaseCanceled { .. } => EventKind::LeaseCanceled,
            PoolEvent::ConnectionCreated { .. } => EventKind::ConnectionCreated,
            PoolEvent::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            PoolEvent::EphemeralReaped { .. } => EventKind::EphemeralReaped,
        }
    }

    /// The connection this event concerns, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            PoolEvent::LeaseGranted { connection, .. }
            | PoolEvent::LeaseYielded { connection, .. }
            | PoolEvent::LeaseExpired { connection, .. }
            | PoolEvent::ConnectionCreated { connection, .. }
            | PoolEvent::ConnectionClosed { connection, .. }
            | PoolEvent::EphemeralReaped { connection } => Some(*connection),
            PoolEvent::LeaseCanceled { connection, .. } => *connection,
            _ => None,
        }
    }
}

/// Receives pool lifecycle events.
pub trait PoolListener<U>: Send + Sync + 'static {
    /// Called once for each event.
    fn on_event(&self, event: &PoolEvent<U>);
}

impl<U, F> PoolListener<U> for F
where
    F: Fn(&PoolEvent<U>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &PoolEvent<U>) {
        (self)(event)
    }
}

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a registered listener, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Registry<U> = Vec<(ListenerId, Arc<dyn PoolListener<U>>)>;

/// Registered listeners, shared between the pool handle and its decoupler.
pub(crate) struct Listeners<U> {
    inner: Arc<RwLock<Registry<U>>>,
}

impl<U> Clone for Listeners<U> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<U> Default for Listeners<U> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<U> fmt::Debug for Listeners<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.inner.read().len())
            .finish()
    }
}

impl<U> Listeners<U> {
    pub(crate) fn add(&self, listener: Arc<dyn PoolListener<U>>) -> ListenerId {
        let id = ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.inner.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut registry = self.inner.write();
        let before = registry.len();
        registry.retain(|(registered, _)| *registered != id);
        registry.len() != before
    }

    /// Deliver `event` to every listener, in registration order.
    pub(crate) fn notify(&self, event: &PoolEvent<U>)
    where
        U: 'static,
    {
        // Listeners may register or remove listeners from within a callback.
        let snapshot: Vec<_> = self
            .inner
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        tracing::trace!(kind=?event.kind(), listeners=snapshot.len(), "pool event");
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}
