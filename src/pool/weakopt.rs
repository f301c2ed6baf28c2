use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use crate::DebugLiteral;

/// A weak back-reference which may never have pointed anywhere.
///
/// Leases and the decoupler use this to reach the pool handle's shared state
/// without keeping the pool alive.
pub(crate) struct WeakOpt<T>(Option<Weak<T>>);

impl<T> WeakOpt<T> {
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub(crate) fn downgrade(arc: &Arc<T>) -> Self {
        Self(Some(Arc::downgrade(arc)))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref().and_then(|weak| weak.upgrade())
    }
}

impl<T> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for WeakOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.0.as_ref().map(|weak| weak.strong_count() > 0) {
            Some(true) => "live",
            Some(false) => "dropped",
            None => "none",
        };
        f.debug_tuple("WeakOpt").field(&DebugLiteral(state)).finish()
    }
}
