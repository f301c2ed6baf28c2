//! Lifeguard
//!
//! A client-side pool of long-lived connections to a single remote endpoint,
//! handed out on time-boxed leases.
//!
//! The pool keeps two classes of connection:
//!
//! - *Immortal* connections are opened when the pool starts and are replaced
//!   whenever they close, so the pool always tries to hold the configured number.
//! - *Ephemeral* connections are opened on demand (up to a cap) when no immortal
//!   connection is free, and age out after sitting idle for a configured lifespan.
//!
//! All pool state is owned by a single task (the decoupler) which processes one
//! command at a time. Callers, transport callbacks and the periodic reaper all
//! talk to that task through channels, so no lock guards the pool's collections.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use lifeguard::{Pool, ConnectRequest, Connection};
//! # #[derive(Clone)] struct Conn;
//! # impl Connection for Conn {
//! #     fn is_open(&self) -> bool { true }
//! #     fn close(&self) {}
//! # }
//! # async fn example() -> Result<(), lifeguard::Error> {
//! let pool: Pool<Conn, &'static str> = Pool::builder()
//!     .with_endpoint("tcp://127.0.0.1:1887".parse().unwrap())
//!     .with_connector(tower::service_fn(|_: ConnectRequest| async {
//!         Ok::<_, std::io::Error>(Conn)
//!     }))
//!     .with_immortal_count(2)
//!     .build()?;
//!
//! pool.start().await?;
//! let lease = pool.lease(Duration::from_secs(5), "request-1").await?;
//! // ... use the connection ...
//! lease.release().await?;
//! pool.stop(false).await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod config;
pub mod conn;
mod error;
pub mod hooks;
pub mod listener;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
mod notify;
pub mod pool;
pub mod reaper;
pub mod slot;
pub mod task;

pub use self::config::Config;
pub use self::conn::{ConnectRequest, Connection, ConnectionClass, ConnectionId, Connector};
pub use self::error::{Error, ProtocolStateError};
pub use self::listener::{EventKind, ListenerId, PoolEvent, PoolListener};
pub use self::notify::Expired;
pub use self::pool::{Builder, Lease, LeaseFuture, LeaseHandle, Pool, PoolStatus, RequestId};
pub use self::slot::LeaseId;

/// Boxed error type used for collaborator failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed future type used for type-erased asynchronous work.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
