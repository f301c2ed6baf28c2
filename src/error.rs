use thiserror::Error;

use crate::conn::ConnectionId;
use crate::slot::LeaseId;
use crate::BoxError;

/// Pool error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool could not be built from the supplied collaborators.
    #[error("configuration: {0}")]
    Configuration(&'static str),

    /// A lease was requested after shutdown began.
    #[error("pool is shutting down")]
    ShutdownRejected,

    /// A yield did not match the pool's view of the connection.
    #[error("protocol state: {0}")]
    ProtocolState(#[from] ProtocolStateError),

    /// The lease request was canceled before a connection was handed out.
    #[error("lease request canceled")]
    Canceled,

    /// No connection was granted within the caller's timeout.
    #[error("lease request timed out")]
    Timeout,

    /// The connector failed to open a connection.
    #[error("connecting: {0}")]
    Connect(#[source] BoxError),

    /// The post-connect establish phase failed.
    #[error("establishing: {0}")]
    Establish(#[source] BoxError),

    /// The transport reported an I/O failure on an open connection.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),

    /// The pool's decoupler is no longer running.
    #[error("pool closed, no connection can be leased")]
    Unavailable,
}

/// Misuse of the lease/yield protocol.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolStateError {
    /// The connection is sitting in the pool, not out on lease.
    #[error("{0} is not out on lease")]
    NotLeased(ConnectionId),

    /// The pool does not know the connection; the lease has probably expired.
    #[error("unknown connection {0}, has the lease expired?")]
    Unknown(ConnectionId),

    /// The connection is leased, but to a different lease.
    #[error("{lease} is not the current lease on {connection}")]
    StaleLease {
        /// Connection the yield referred to.
        connection: ConnectionId,
        /// Lease presented by the caller.
        lease: LeaseId,
    },
}

impl Error {
    /// Returns `true` if this error was caused by misuse of lease/yield.
    pub fn is_protocol_state(&self) -> bool {
        matches!(self, Error::ProtocolState(_))
    }
}
