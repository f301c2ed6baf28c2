//! Strategies for choosing which outstanding leases to expire.
//!
//! On every reaper tick the pool hands the strategy a snapshot of its leased
//! slots. The strategy returns the leases it wants expired; each one is then
//! passed through the pool's [`LeaseExpiredHandler`](crate::hooks::LeaseExpiredHandler)
//! before its connection is closed.

use tokio::time::Instant;

use crate::slot::{LeaseId, LeasedSlot};

/// Chooses which leases to expire on a reaper tick.
pub trait LeaseReaper<C, U>: Send + 'static {
    /// Return the leases from `leased` which should be expired at `now`.
    fn reap(&mut self, leased: &[&LeasedSlot<C, U>], now: Instant) -> Vec<LeaseId>;
}

impl<C, U, F> LeaseReaper<C, U> for F
where
    F: FnMut(&[&LeasedSlot<C, U>], Instant) -> Vec<LeaseId> + Send + 'static,
{
    fn reap(&mut self, leased: &[&LeasedSlot<C, U>], now: Instant) -> Vec<LeaseId> {
        (self)(leased, now)
    }
}

/// Expires every lease whose deadline has passed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullPassReaper;

impl<C, U> LeaseReaper<C, U> for FullPassReaper {
    fn reap(&mut self, leased: &[&LeasedSlot<C, U>], now: Instant) -> Vec<LeaseId> {
        leased
            .iter()
            .filter(|slot| slot.is_overdue(now))
            .map(|slot| slot.lease())
            .collect()
    }
}
