//! Connection handles and the connector which opens them.
//!
//! The pool never reads or writes on a connection. It only needs to know whether a
//! connection is still usable, and how to close it. Everything about how bytes
//! move (sockets, codecs, handshakes) belongs to the [`Connector`] and the
//! [`Connection`] implementation supplied by the user.
//!
//! ## Connector
//!
//! A connector is a [`tower::Service`] which accepts a [`ConnectRequest`] and
//! produces a connection. The request carries the endpoint, the identifier the
//! pool assigned to the new connection, and a [`ConnectionNotifier`] which the
//! transport uses to tell the pool when the connection goes inactive, stops
//! being writable, or hits an I/O error.
//!
//! ## Transport callbacks
//!
//! Transport events usually arrive on whatever thread or task the transport runs
//! on. The notifier never touches pool state directly: it enqueues the event for
//! the pool's decoupler, which handles it in its own turn.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::Uri;
use tokio::sync::mpsc::UnboundedSender;
use tower::Service;

use crate::pool::Signal;
use crate::BoxError;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a single connection for its whole life in the pool.
///
/// Identifiers are never reused, so a stale identifier can always be told apart
/// from a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The lifecycle class of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    /// Opened at start, never ages out, and is replaced when closed.
    Immortal,

    /// Opened on demand, ages out after its idle lifespan, never replaced.
    Ephemeral,
}

impl ConnectionClass {
    /// Returns `true` for immortal connections.
    pub fn is_immortal(&self) -> bool {
        matches!(self, ConnectionClass::Immortal)
    }
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionClass::Immortal => f.write_str("immortal"),
            ConnectionClass::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

/// A live connection that can be held by the pool.
///
/// Connections are handles: the pool keeps one clone for as long as the
/// connection is open, and hands another clone to the current lease holder.
/// Closing any clone must close the underlying connection.
pub trait Connection: Clone + Send + Sync + 'static {
    /// Returns `true` if the connection is open.
    fn is_open(&self) -> bool;

    /// Returns `true` if the connection can currently accept writes.
    fn is_writable(&self) -> bool {
        self.is_open()
    }

    /// Close the connection. Closing an already-closed connection is a no-op.
    fn close(&self);
}

/// A request to open one new connection for the pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectRequest {
    /// The identifier the pool will use for this connection.
    pub id: ConnectionId,

    /// The class the connection will join once established.
    pub class: ConnectionClass,

    /// The remote endpoint to connect to.
    pub endpoint: Uri,

    /// Handler name tag from the pool configuration.
    pub handler_name: Arc<str>,

    /// Channel back into the pool for transport lifecycle events.
    pub notifier: ConnectionNotifier,
}

/// A connector opens new connections for the pool.
///
/// This trait is implemented for every cloneable [`tower::Service`] which accepts a
/// [`ConnectRequest`] and returns a [`Connection`], so a plain
/// [`tower::service_fn`] is enough to act as a connector.
pub trait Connector<C>
where
    Self: Service<ConnectRequest, Response = C> + Clone + Send + 'static,
    C: Connection,
{
}

impl<T, C> Connector<C> for T
where
    T: Service<ConnectRequest, Response = C> + Clone + Send + 'static,
    C: Connection,
{
}

/// A transport-level problem observed on an open connection.
#[derive(Debug)]
#[non_exhaustive]
pub enum Fault {
    /// The connection is no longer active.
    Inactive,

    /// The connection lost writability.
    Unwritable,

    /// The transport raised an error.
    Io(BoxError),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Inactive => f.write_str("connection inactive"),
            Fault::Unwritable => f.write_str("connection not writable"),
            Fault::Io(error) => write!(f, "i/o error: {error}"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Inactive,
    WritabilityChanged,
    Error(BoxError),
}

/// Handle given to the transport so it can report lifecycle events for one connection.
///
/// Events are queued for the pool's decoupler and handled in order. Once the pool
/// has shut down, events are silently dropped.
#[derive(Clone)]
pub struct ConnectionNotifier {
    id: ConnectionId,
    signals: UnboundedSender<Signal>,
}

impl fmt::Debug for ConnectionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionNotifier").field(&self.id).finish()
    }
}

impl ConnectionNotifier {
    pub(crate) fn new(id: ConnectionId, signals: UnboundedSender<Signal>) -> Self {
        Self { id, signals }
    }

    /// The connection this notifier reports for.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection went inactive (the remote end closed it, or it was reset).
    pub fn inactive(&self) {
        self.send(TransportEvent::Inactive);
    }

    /// The connection's writability changed; the pool will re-check [`Connection::is_writable`].
    pub fn writability_changed(&self) {
        self.send(TransportEvent::WritabilityChanged);
    }

    /// The transport hit an error on this connection.
    pub fn error<E>(&self, error: E)
    where
        E: Into<BoxError>,
    {
        self.send(TransportEvent::Error(error.into()));
    }

    fn send(&self, event: TransportEvent) {
        if self
            .signals
            .send(Signal::Transport(self.id, event))
            .is_err()
        {
            tracing::trace!(id=%self.id, "pool closed, dropping transport event");
        }
    }
}
