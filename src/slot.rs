//! Records of where each pooled connection currently sits.
//!
//! A connection is always in exactly one of three places: still opening, sitting
//! in the pool as an [`AvailableSlot`], or out on loan as a [`LeasedSlot`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::conn::{Connection, ConnectionClass, ConnectionId};
use crate::notify;

static LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one grant of a connection to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(u64);

impl LeaseId {
    pub(crate) fn next() -> Self {
        Self(LEASE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// A connection sitting in the pool, ready to be leased.
#[derive(Debug)]
pub struct AvailableSlot<C> {
    id: ConnectionId,
    connection: C,
    class: ConnectionClass,
    expires_at: Option<Instant>,
}

impl<C> AvailableSlot<C> {
    /// An immortal slot never expires.
    pub(crate) fn immortal(id: ConnectionId, connection: C) -> Self {
        Self {
            id,
            connection,
            class: ConnectionClass::Immortal,
            expires_at: None,
        }
    }

    /// An ephemeral slot expires `lifespan` after `now`.
    pub(crate) fn ephemeral(id: ConnectionId, connection: C, now: Instant, lifespan: Duration) -> Self {
        Self {
            id,
            connection,
            class: ConnectionClass::Ephemeral,
            expires_at: now.checked_add(lifespan),
        }
    }

    pub(crate) fn new(
        id: ConnectionId,
        connection: C,
        class: ConnectionClass,
        now: Instant,
        lifespan: Duration,
    ) -> Self {
        match class {
            ConnectionClass::Immortal => Self::immortal(id, connection),
            ConnectionClass::Ephemeral => Self::ephemeral(id, connection, now, lifespan),
        }
    }

    /// The pooled connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The pooled connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Which class this slot belongs to.
    pub fn class(&self) -> ConnectionClass {
        self.class
    }

    /// When this slot ages out, if ever.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Has this slot aged out at `now`?
    ///
    /// Immortal slots never expire.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub(crate) fn into_connection(self) -> C {
        self.connection
    }
}

/// A connection currently out on lease.
pub struct LeasedSlot<C, U> {
    id: ConnectionId,
    lease: LeaseId,
    connection: C,
    origin: ConnectionClass,
    granted_at: Instant,
    deadline: Option<Instant>,
    correlation: U,
    expiry: notify::Sender,
}

impl<C, U> fmt::Debug for LeasedSlot<C, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedSlot")
            .field("id", &self.id)
            .field("lease", &self.lease)
            .field("origin", &self.origin)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<C, U> LeasedSlot<C, U> {
    pub(crate) fn new(
        slot: AvailableSlot<C>,
        now: Instant,
        duration: Duration,
        correlation: U,
        expiry: notify::Sender,
    ) -> Self {
        Self {
            id: slot.id,
            lease: LeaseId::next(),
            origin: slot.class,
            connection: slot.connection,
            granted_at: now,
            deadline: now.checked_add(duration),
            correlation,
            expiry,
        }
    }

    /// The leased connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The lease this slot records.
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// The leased connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// The class the connection returns to when yielded.
    pub fn origin(&self) -> ConnectionClass {
        self.origin
    }

    /// When the lease was granted.
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    /// When the lease runs out. Leases too long to represent have no deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The caller-supplied correlation value.
    pub fn correlation(&self) -> &U {
        &self.correlation
    }

    /// Has the lease run past its deadline at `now`?
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.deadline.map(|at| at < now).unwrap_or(false)
    }

    /// Tell the lease holder that this lease was expired by the pool.
    pub(crate) fn signal_expired(&self) {
        self.expiry.send();
    }

    /// Return the connection to the pool as an available slot of its origin class.
    pub(crate) fn into_available(self, now: Instant, lifespan: Duration) -> (AvailableSlot<C>, U) {
        trace!(id=%self.id, lease=%self.lease, origin=%self.origin, "lease returned");
        (
            AvailableSlot::new(self.id, self.connection, self.origin, now, lifespan),
            self.correlation,
        )
    }

    pub(crate) fn into_parts(self) -> (C, ConnectionClass, U) {
        (self.connection, self.origin, self.correlation)
    }
}

/// Available connections of one class, in lease order.
#[derive(Debug)]
pub(crate) struct AvailableSlots<C> {
    inner: VecDeque<AvailableSlot<C>>,
}

impl<C> Default for AvailableSlots<C> {
    fn default() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }
}

impl<C> AvailableSlots<C> {
    pub(crate) fn push(&mut self, slot: AvailableSlot<C>) {
        self.inner.push_back(slot);
    }

    /// Take the first slot accepted by `accept`.
    ///
    /// Each slot is offered to `accept` at most once. Rejected slots move to the
    /// back of the list, so the next attempt starts with a different connection.
    pub(crate) fn take_first<F>(&mut self, mut accept: F) -> Option<AvailableSlot<C>>
    where
        F: FnMut(&AvailableSlot<C>) -> bool,
    {
        let candidates = self.inner.len();
        trace!("checking {} available connections", candidates);

        for _ in 0..candidates {
            let slot = self.inner.pop_front()?;
            if accept(&slot) {
                return Some(slot);
            }

            trace!(id=%slot.id, "candidate skipped");
            self.inner.push_back(slot);
        }

        None
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<AvailableSlot<C>> {
        let index = self.inner.iter().position(|slot| slot.id == id)?;
        self.inner.remove(index)
    }

    /// Remove every slot which has aged out at `now`.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<AvailableSlot<C>> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.inner.len());

        for slot in self.inner.drain(..) {
            if slot.is_expired(now) {
                trace!(id=%slot.id, "found expired connection");
                expired.push(slot);
            } else {
                kept.push_back(slot);
            }
        }

        self.inner = kept;
        expired
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = AvailableSlot<C>> + '_ {
        self.inner.drain(..)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &AvailableSlot<C>> {
        self.inner.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<C: Connection> AvailableSlot<C> {
    /// A slot is usable if it has not aged out and its connection is still open.
    pub(crate) fn is_usable(&self, now: Instant) -> bool {
        !self.is_expired(now) && self.connection.is_open()
    }
}
