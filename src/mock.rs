//! Mock connections and connector, for testing pools without a network.

use std::future::ready;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::conn::{ConnectRequest, Connection, ConnectionId, ConnectionNotifier};

/// Error returned by a failing [`MockConnector`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("mock connection error")]
pub struct MockConnectionError;

/// An in-memory connection with switchable open and writable flags.
#[derive(Debug, Clone)]
pub struct MockConnection {
    id: ConnectionId,
    open: Arc<AtomicBool>,
    writable: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl MockConnection {
    /// Create an open connection with a fresh identifier.
    pub fn new() -> Self {
        Self::with_id(ConnectionId::next())
    }

    /// Create an open connection with the given identifier.
    pub fn with_id(id: ConnectionId) -> Self {
        trace!(%id, "creating mock connection");
        Self {
            id,
            open: Arc::new(AtomicBool::new(true)),
            writable: Arc::new(AtomicBool::new(true)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The identifier this connection was created with.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Mark the connection closed without going through [`Connection::close`].
    pub fn drop_remote(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Set whether the connection accepts writes.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// How many times [`Connection::close`] was called on any clone.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.writable.load(Ordering::SeqCst)
    }

    fn close(&self) {
        trace!(id=%self.id, "closing mock connection");
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A connector which produces [`MockConnection`]s and remembers them.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    failing: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    opened: Arc<Mutex<Vec<(MockConnection, ConnectionNotifier)>>>,
}

impl MockConnector {
    /// A connector whose connections always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose connections always fail.
    pub fn failing() -> Self {
        let connector = Self::default();
        connector.set_failing(true);
        connector
    }

    /// Switch between failing and succeeding connections.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of connection attempts, successful or not.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every connection opened so far, in order.
    pub fn opened(&self) -> Vec<MockConnection> {
        self.opened.lock().iter().map(|(conn, _)| conn.clone()).collect()
    }

    /// The connection opened with the given identifier.
    pub fn connection(&self, id: ConnectionId) -> Option<MockConnection> {
        self.opened
            .lock()
            .iter()
            .find(|(conn, _)| conn.id() == id)
            .map(|(conn, _)| conn.clone())
    }

    /// The transport notifier handed over with the given connection.
    pub fn notifier(&self, id: ConnectionId) -> Option<ConnectionNotifier> {
        self.opened
            .lock()
            .iter()
            .find(|(conn, _)| conn.id() == id)
            .map(|(_, notifier)| notifier.clone())
    }
}

impl tower::Service<ConnectRequest> for MockConnector {
    type Response = MockConnection;
    type Error = MockConnectionError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ConnectRequest) -> Self::Future {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            trace!(id=%req.id, "mock connect failing");
            return ready(Err(MockConnectionError)).boxed();
        }

        let conn = MockConnection::with_id(req.id);
        self.opened.lock().push((conn.clone(), req.notifier));
        ready(Ok(conn)).boxed()
    }
}
