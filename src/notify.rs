use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    task::Context,
};

use crate::BoxFuture;

/// Held by the pool for each outstanding lease.
#[derive(Debug)]
pub(crate) struct Sender(tokio::sync::watch::Sender<bool>);

impl Sender {
    pub(crate) fn send(&self) {
        self.0.send_replace(true);
        tracing::trace!("sending expiry signal");
    }
}

/// Held by the lease holder, resolves once the pool expires the lease.
#[derive(Debug, Clone)]
pub(crate) struct Receiver(tokio::sync::watch::Receiver<bool>);

impl Receiver {
    pub(crate) fn is_expired(&self) -> bool {
        *self.0.borrow()
    }
}

impl IntoFuture for Receiver {
    type IntoFuture = Expired;
    type Output = bool;

    fn into_future(mut self) -> Self::IntoFuture {
        Expired(Box::pin(async move { self.0.wait_for(|expired| *expired).await.is_ok() }))
    }
}

/// Future which resolves when the pool is done with a lease.
///
/// Resolves to `true` if the pool expired the lease, or `false` if the lease
/// ended any other way (it was yielded, or the pool shut down).
#[pin_project::pin_project]
pub struct Expired(#[pin] BoxFuture<'static, bool>);

impl std::fmt::Debug for Expired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Expired").finish()
    }
}

impl Future for Expired {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> std::task::Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

pub(crate) fn channel() -> (Sender, Receiver) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (Sender(tx), Receiver(rx))
}
