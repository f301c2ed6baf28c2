//! Pool sizing and timing configuration.

use std::time::Duration;

use crate::Error;

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Number of immortal connections the pool opens at start and keeps replacing.
    pub immortal_count: usize,

    /// Maximum number of ephemeral connections opened on demand.
    pub max_ephemeral_count: usize,

    /// How long a yielded ephemeral connection may sit idle before it is reaped.
    pub ephemeral_lifespan: Duration,

    /// How often the reaper checks for expired leases and aged-out ephemeral connections.
    pub reaper_interval: Duration,

    /// Name tag handed to the connector and attached to the pool's tracing span.
    pub handler_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            immortal_count: 5,
            max_ephemeral_count: 5,
            ephemeral_lifespan: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(15),
            handler_name: String::from("_pool"),
        }
    }
}

impl Config {
    /// Total number of connections the pool may hold at once.
    pub fn capacity(&self) -> usize {
        self.immortal_count + self.max_ephemeral_count
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.reaper_interval.is_zero() {
            return Err(Error::Configuration("reaper interval must be non-zero"));
        }

        if self.capacity() == 0 {
            return Err(Error::Configuration(
                "pool must allow at least one immortal or ephemeral connection",
            ));
        }

        Ok(())
    }
}
