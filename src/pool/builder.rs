use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use tokio::sync::mpsc;
use tower::ServiceExt;

use super::engine::{BoxConnector, Engine, Hooks};
use super::Pool;
use crate::config::Config;
use crate::conn::{Connection, Connector};
use crate::hooks::{
    CloseExpired, CloseOnFault, ContextExceptionHandler, EstablishImmediately, GrantAll,
    LeaseExpiredHandler, LogExceptions, PoolExceptionHandler, PostConnectEstablish, PreGrantLease,
    PreReturnToPool, ReturnAll,
};
use crate::listener::{Listeners, PoolListener};
use crate::reaper::{FullPassReaper, LeaseReaper};
use crate::{BoxError, Error};

/// A builder for a [`Pool`].
///
/// A connector and an endpoint are required; every hook has a default.
pub struct Builder<C, U = ()> {
    config: Config,
    endpoint: Option<Uri>,
    connector: Option<BoxConnector<C>>,
    hooks: Hooks<C, U>,
    reaper: Box<dyn LeaseReaper<C, U>>,
    listeners: Listeners<U>,
}

impl<C, U> fmt::Debug for Builder<C, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("endpoint", &self.endpoint)
            .field("connector", &self.connector.is_some())
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl<C, U> Default for Builder<C, U>
where
    C: Connection,
    U: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, U> Builder<C, U>
where
    C: Connection,
    U: Clone + Send + Sync + 'static,
{
    /// Create a builder with the default configuration and hooks.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            endpoint: None,
            connector: None,
            hooks: Hooks {
                pre_grant: Box::new(GrantAll),
                pre_return: Box::new(ReturnAll),
                on_fault: Box::new(CloseOnFault),
                on_expired: Box::new(CloseExpired),
                establish: Box::new(EstablishImmediately),
                exceptions: Arc::new(LogExceptions),
            },
            reaper: Box::new(FullPassReaper),
            listeners: Listeners::default(),
        }
    }

    /// Use the provided configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Mutable access to the configuration.
    pub fn config(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Set the number of immortal connections.
    pub fn with_immortal_count(mut self, count: usize) -> Self {
        self.config.immortal_count = count;
        self
    }

    /// Set the cap on ephemeral connections.
    pub fn with_max_ephemeral_count(mut self, count: usize) -> Self {
        self.config.max_ephemeral_count = count;
        self
    }

    /// Set how long a yielded ephemeral connection may sit idle.
    pub fn with_ephemeral_lifespan(mut self, lifespan: Duration) -> Self {
        self.config.ephemeral_lifespan = lifespan;
        self
    }

    /// Set how often the reaper runs.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    /// Set the name tag used in logs and handed to the connector.
    pub fn with_handler_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.handler_name = name.into();
        self
    }

    /// Set the endpoint every connection is opened to.
    pub fn with_endpoint(mut self, endpoint: Uri) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Use the provided connector to open connections.
    pub fn with_connector<T>(mut self, connector: T) -> Self
    where
        T: Connector<C>,
        T::Error: Into<BoxError>,
        T::Future: Send + 'static,
    {
        self.connector = Some(BoxConnector::new(connector.map_err(Into::into)));
        self
    }

    /// Decide, per candidate, whether it may be granted.
    pub fn with_pre_grant<H>(mut self, hook: H) -> Self
    where
        H: PreGrantLease<C>,
    {
        self.hooks.pre_grant = Box::new(hook);
        self
    }

    /// Decide whether a yielded connection goes back into the pool.
    pub fn with_pre_return<H>(mut self, hook: H) -> Self
    where
        H: PreReturnToPool<C>,
    {
        self.hooks.pre_return = Box::new(hook);
        self
    }

    /// Decide whether a connection is closed when its transport reports a fault.
    pub fn with_context_exception_handler<H>(mut self, hook: H) -> Self
    where
        H: ContextExceptionHandler<C>,
    {
        self.hooks.on_fault = Box::new(hook);
        self
    }

    /// Decide whether an overdue lease selected by the reaper is expired.
    pub fn with_lease_expired_handler<H>(mut self, hook: H) -> Self
    where
        H: LeaseExpiredHandler<C, U>,
    {
        self.hooks.on_expired = Box::new(hook);
        self
    }

    /// Run an establish phase on every new connection before it is pooled.
    pub fn with_post_connect_establish<H>(mut self, hook: H) -> Self
    where
        H: PostConnectEstablish<C>,
    {
        self.hooks.establish = Box::new(hook);
        self
    }

    /// Handle errors raised inside the pool.
    pub fn with_pool_exception_handler<H>(mut self, hook: H) -> Self
    where
        H: PoolExceptionHandler,
    {
        self.hooks.exceptions = Arc::new(hook);
        self
    }

    /// Choose which leases the reaper expires.
    pub fn with_reaper<R>(mut self, reaper: R) -> Self
    where
        R: LeaseReaper<C, U>,
    {
        self.reaper = Box::new(reaper);
        self
    }

    /// Register a listener before the pool starts, so it sees every event.
    pub fn with_listener<L>(self, listener: L) -> Self
    where
        L: PoolListener<U>,
    {
        self.listeners.add(Arc::new(listener));
        self
    }

    /// Build the pool and spawn its decoupler on the current tokio runtime.
    ///
    /// The pool does not open any connections until [`Pool::start`] is called.
    pub fn build(self) -> Result<Pool<C, U>, Error> {
        let connector = self
            .connector
            .ok_or(Error::Configuration("a connector is required"))?;
        let endpoint = self
            .endpoint
            .ok_or(Error::Configuration("an endpoint is required"))?;
        self.config.validate()?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Configuration("a tokio runtime is required"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Pool::new(tx, self.listeners.clone(), self.config.clone());
        let engine = Engine::new(
            self.config,
            endpoint,
            connector,
            self.hooks,
            self.reaper,
            self.listeners,
            pool.downgrade(),
            rx,
        );

        runtime.spawn(engine.run());
        Ok(pool)
    }
}
