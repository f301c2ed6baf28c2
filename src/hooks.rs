//! Policy hooks consulted by the pool at each decision point.
//!
//! Every hook returns an explicit decision value. Each hook trait is implemented
//! for plain closures with the matching signature, and has a default
//! implementation used when the builder is not given one.

use tokio::sync::mpsc::UnboundedSender;

use crate::conn::{ConnectionId, Fault};
use crate::pool::{PoolStatus, Signal};
use crate::slot::{AvailableSlot, LeasedSlot};
use crate::{BoxError, Error};

/// Whether an available connection may be granted to the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDecision {
    /// Grant this connection.
    Grant,

    /// Skip this connection and consider the next one.
    Skip,
}

/// Whether a yielded connection goes back into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDecision {
    /// Return the connection to the pool.
    Return,

    /// Close the connection instead.
    Dispose,
}

/// What to do with a connection that reported a transport fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// Close the connection.
    Close,

    /// Leave the connection in place.
    Tolerate,
}

/// What to do with a lease which has run past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryDecision {
    /// Expire the lease and close its connection.
    Close,

    /// Leave the lease in place until the next reaper pass.
    Keep,
}

/// Consulted for each candidate connection before it is granted.
pub trait PreGrantLease<C>: Send + Sync + 'static {
    /// Decide whether `slot` may be granted.
    fn pre_grant(&self, slot: &AvailableSlot<C>, status: &PoolStatus) -> GrantDecision;
}

impl<C, F> PreGrantLease<C> for F
where
    F: Fn(&AvailableSlot<C>, &PoolStatus) -> GrantDecision + Send + Sync + 'static,
{
    fn pre_grant(&self, slot: &AvailableSlot<C>, status: &PoolStatus) -> GrantDecision {
        (self)(slot, status)
    }
}

/// Grants every candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

impl<C> PreGrantLease<C> for GrantAll {
    fn pre_grant(&self, _: &AvailableSlot<C>, _: &PoolStatus) -> GrantDecision {
        GrantDecision::Grant
    }
}

/// Consulted before a yielded connection is put back into the pool.
pub trait PreReturnToPool<C>: Send + Sync + 'static {
    /// Decide whether `connection` goes back into the pool.
    fn pre_return(&self, connection: &C, status: &PoolStatus) -> ReturnDecision;
}

impl<C, F> PreReturnToPool<C> for F
where
    F: Fn(&C, &PoolStatus) -> ReturnDecision + Send + Sync + 'static,
{
    fn pre_return(&self, connection: &C, status: &PoolStatus) -> ReturnDecision {
        (self)(connection, status)
    }
}

/// Returns every yielded connection to the pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnAll;

impl<C> PreReturnToPool<C> for ReturnAll {
    fn pre_return(&self, _: &C, _: &PoolStatus) -> ReturnDecision {
        ReturnDecision::Return
    }
}

/// Consulted when the transport reports a fault on a connection.
pub trait ContextExceptionHandler<C>: Send + Sync + 'static {
    /// Decide whether the faulted connection is closed.
    fn on_fault(&self, connection: &C, fault: &Fault, status: &PoolStatus) -> FaultDecision;
}

impl<C, F> ContextExceptionHandler<C> for F
where
    F: Fn(&C, &Fault, &PoolStatus) -> FaultDecision + Send + Sync + 'static,
{
    fn on_fault(&self, connection: &C, fault: &Fault, status: &PoolStatus) -> FaultDecision {
        (self)(connection, fault, status)
    }
}

/// Closes the connection on every fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOnFault;

impl<C> ContextExceptionHandler<C> for CloseOnFault {
    fn on_fault(&self, _: &C, _: &Fault, _: &PoolStatus) -> FaultDecision {
        FaultDecision::Close
    }
}

/// Consulted for each lease the reaper selects for expiry.
pub trait LeaseExpiredHandler<C, U>: Send + Sync + 'static {
    /// Decide whether the overdue lease is expired now.
    fn on_lease_expired(&self, slot: &LeasedSlot<C, U>, status: &PoolStatus) -> ExpiryDecision;
}

impl<C, U, F> LeaseExpiredHandler<C, U> for F
where
    F: Fn(&LeasedSlot<C, U>, &PoolStatus) -> ExpiryDecision + Send + Sync + 'static,
{
    fn on_lease_expired(&self, slot: &LeasedSlot<C, U>, status: &PoolStatus) -> ExpiryDecision {
        (self)(slot, status)
    }
}

/// Expires every lease the reaper selects.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseExpired;

impl<C, U> LeaseExpiredHandler<C, U> for CloseExpired {
    fn on_lease_expired(&self, _: &LeasedSlot<C, U>, _: &PoolStatus) -> ExpiryDecision {
        ExpiryDecision::Close
    }
}

/// Completion token for the post-connect establish phase.
///
/// Call [`Established::complete`] once the connection is ready to be pooled, or
/// [`Established::fail`] if it is not. Dropping the token without calling either
/// fails the connection.
#[derive(Debug)]
pub struct Established {
    id: ConnectionId,
    signals: UnboundedSender<Signal>,
    sent: bool,
}

impl Established {
    pub(crate) fn new(id: ConnectionId, signals: UnboundedSender<Signal>) -> Self {
        Self {
            id,
            signals,
            sent: false,
        }
    }

    /// The connection being established.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection is ready to join the pool.
    pub fn complete(mut self) {
        self.send(Ok(()));
    }

    /// The connection could not be established, and will be closed.
    pub fn fail<E>(mut self, error: E)
    where
        E: Into<BoxError>,
    {
        self.send(Err(error.into()));
    }

    fn send(&mut self, result: Result<(), BoxError>) {
        self.sent = true;
        if self.signals.send(Signal::Established(self.id, result)).is_err() {
            tracing::trace!(id=%self.id, "pool closed, dropping establish result");
        }
    }
}

impl Drop for Established {
    fn drop(&mut self) {
        if !self.sent {
            self.send(Err("establish phase ended without completing".into()));
        }
    }
}

/// Runs after a connection opens, before it joins the pool.
///
/// The phase may finish asynchronously: keep the [`Established`] token (for
/// example, by moving it into a spawned task) and complete it later.
pub trait PostConnectEstablish<C>: Send + Sync + 'static {
    /// Begin establishing `connection`.
    fn establish(&self, connection: &C, done: Established);
}

impl<C, F> PostConnectEstablish<C> for F
where
    F: Fn(&C, Established) + Send + Sync + 'static,
{
    fn establish(&self, connection: &C, done: Established) {
        (self)(connection, done)
    }
}

/// Completes every connection as soon as it opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstablishImmediately;

impl<C> PostConnectEstablish<C> for EstablishImmediately {
    fn establish(&self, _: &C, done: Established) {
        done.complete();
    }
}

/// Sink for errors raised inside the pool which have no caller to go to.
pub trait PoolExceptionHandler: Send + Sync + 'static {
    /// Handle one error.
    fn on_exception(&self, error: &Error);
}

impl<F> PoolExceptionHandler for F
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    fn on_exception(&self, error: &Error) {
        (self)(error)
    }
}

/// Logs pool errors with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExceptions;

impl PoolExceptionHandler for LogExceptions {
    fn on_exception(&self, error: &Error) {
        if error.is_protocol_state() {
            tracing::warn!("pool protocol misuse: {error}");
        } else {
            tracing::error!("pool error: {error}");
        }
    }
}
