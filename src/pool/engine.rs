//! The decoupler: the single task which owns all pool state.
//!
//! Every change to the pool happens inside one turn of [`Engine::run`]. A turn
//! handles exactly one input: a command from a pool handle, a signal from a
//! transport or establish token, the result of a connection attempt, or a reaper
//! tick. Requests woken during a turn are re-attempted before the next input is
//! taken, so a woken request is never overtaken by a newer command.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use http::Uri;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tracing::{debug, trace, Instrument};

use super::lease::{Lease, LeaseAttempt};
use super::{Command, PoolRef, PoolStatus, RequestId, Signal, YieldReason};
use crate::config::Config;
use crate::conn::{
    ConnectRequest, Connection, ConnectionClass, ConnectionId, ConnectionNotifier, Fault,
    TransportEvent,
};
use crate::hooks::{
    ContextExceptionHandler, Established, ExpiryDecision, FaultDecision, GrantDecision,
    LeaseExpiredHandler, PoolExceptionHandler, PostConnectEstablish, PreGrantLease,
    PreReturnToPool, ReturnDecision,
};
use crate::listener::{Listeners, PoolEvent};
use crate::notify;
use crate::reaper::LeaseReaper;
use crate::slot::{AvailableSlot, AvailableSlots, LeaseId, LeasedSlot};
use crate::task::{Attempt, DeferredTask, Outcome, Requeue, Step, TaskQueue};
use crate::{BoxError, Error, ProtocolStateError};

pub(crate) type LeaseTask<C, U> = DeferredTask<LeaseAttempt<U>, Lease<C, U>, Error>;

pub(crate) type BoxConnector<C> = BoxCloneService<ConnectRequest, C, BoxError>;

/// The policy hooks, as configured on the builder.
pub(crate) struct Hooks<C, U> {
    pub(crate) pre_grant: Box<dyn PreGrantLease<C>>,
    pub(crate) pre_return: Box<dyn PreReturnToPool<C>>,
    pub(crate) on_fault: Box<dyn ContextExceptionHandler<C>>,
    pub(crate) on_expired: Box<dyn LeaseExpiredHandler<C, U>>,
    pub(crate) establish: Box<dyn PostConnectEstablish<C>>,
    pub(crate) exceptions: Arc<dyn PoolExceptionHandler>,
}

/// Where a connection currently is.
enum Disposition<C> {
    Connecting(ConnectionClass),
    Establishing(ConnectionClass, C),
    Available(ConnectionClass),
    Leased(LeaseId),
}

impl<C> fmt::Debug for Disposition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Connecting(class) => f.debug_tuple("Connecting").field(class).finish(),
            Disposition::Establishing(class, _) => {
                f.debug_tuple("Establishing").field(class).finish()
            }
            Disposition::Available(class) => f.debug_tuple("Available").field(class).finish(),
            Disposition::Leased(lease) => f.debug_tuple("Leased").field(lease).finish(),
        }
    }
}

/// The result of one connection attempt.
struct Opened<C> {
    id: ConnectionId,
    result: Result<C, BoxError>,
}

/// What one grant attempt produced.
enum Grant<C, U> {
    Granted(Lease<C, U>),
    Canceled,
    Unavailable,
}

pub(crate) struct Engine<C, U> {
    config: Config,
    handler_name: Arc<str>,
    endpoint: Uri,
    connector: BoxConnector<C>,
    hooks: Hooks<C, U>,
    reaper: Box<dyn LeaseReaper<C, U>>,
    listeners: Listeners<U>,
    pool: PoolRef<C, U>,

    immortal: AvailableSlots<C>,
    ephemeral: AvailableSlots<C>,
    leased: BTreeMap<LeaseId, LeasedSlot<C, U>>,
    connections: HashMap<ConnectionId, Disposition<C>>,
    pending: TaskQueue<LeaseTask<C, U>>,
    ready: VecDeque<LeaseTask<C, U>>,
    rescan: bool,
    granted: Option<PoolEvent<U>>,

    started: bool,
    shutting_down: bool,
    stopped: bool,
    stop_waiters: Vec<oneshot::Sender<()>>,

    commands: mpsc::UnboundedReceiver<Command<C, U>>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals: mpsc::UnboundedReceiver<Signal>,
    opened_tx: mpsc::UnboundedSender<Opened<C>>,
    opened: mpsc::UnboundedReceiver<Opened<C>>,
}

impl<C, U> fmt::Debug for Engine<C, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("handler_name", &self.handler_name)
            .field("endpoint", &self.endpoint)
            .field("connections", &self.connections)
            .field("pending", &self.pending.len())
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}

impl<C, U> Engine<C, U>
where
    C: Connection,
    U: Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        endpoint: Uri,
        connector: BoxConnector<C>,
        hooks: Hooks<C, U>,
        reaper: Box<dyn LeaseReaper<C, U>>,
        listeners: Listeners<U>,
        pool: PoolRef<C, U>,
        commands: mpsc::UnboundedReceiver<Command<C, U>>,
    ) -> Self {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (opened_tx, opened) = mpsc::unbounded_channel();

        Self {
            handler_name: Arc::from(config.handler_name.as_str()),
            config,
            endpoint,
            connector,
            hooks,
            reaper,
            listeners,
            pool,
            immortal: AvailableSlots::default(),
            ephemeral: AvailableSlots::default(),
            leased: BTreeMap::new(),
            connections: HashMap::new(),
            pending: TaskQueue::new(),
            ready: VecDeque::new(),
            rescan: false,
            granted: None,
            started: false,
            shutting_down: false,
            stopped: false,
            stop_waiters: Vec::new(),
            commands,
            signals_tx,
            signals,
            opened_tx,
            opened,
        }
    }

    /// Run the decoupler until every pool handle has been dropped.
    pub(crate) async fn run(self) {
        let span = tracing::debug_span!("pool", handler = %self.handler_name);
        self.serve().instrument(span).await
    }

    async fn serve(mut self) {
        let period = self.config.reaper_interval;
        let mut reaper = tokio::time::interval_at(Instant::now() + period, period);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.run_ready();

            tokio::select! {
                biased;
                Some(signal) = self.signals.recv() => self.handle_signal(signal),
                Some(opened) = self.opened.recv() => self.handle_opened(opened),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = reaper.tick() => self.reap(),
            }
        }

        debug!("all pool handles dropped, shutting down");
        self.shutdown();
    }

    async fn handle_command(&mut self, command: Command<C, U>) {
        trace!(?command, "command");
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop(force, reply) => self.stop(force, reply),
            Command::Lease(task) => {
                let attempt = task.attempt();
                self.fire(PoolEvent::LeaseRequested {
                    request: attempt.request,
                    duration: attempt.duration,
                    correlation: attempt.correlation.clone(),
                });
                self.run_task(task);
            }
            Command::Cancel(request) => self.cancel(request),
            Command::Yield {
                connection,
                lease,
                reason,
                reply,
            } => {
                let result = self.yield_lease(connection, lease, reason);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Close(id) => {
                self.close_connection(id);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            available_immortal: self.immortal.len(),
            available_ephemeral: self.ephemeral.len(),
            leased: self.leased.len(),
            pending: self.pending.len() + self.ready.len(),
            immortal_count: self.config.immortal_count,
            max_ephemeral_count: self.config.max_ephemeral_count,
            shutting_down: self.shutting_down,
            stopped: self.stopped,
            ..Default::default()
        };

        status.leased_immortal = self
            .leased
            .values()
            .filter(|slot| slot.origin().is_immortal())
            .count();

        for disposition in self.connections.values() {
            match disposition {
                Disposition::Connecting(class) | Disposition::Establishing(class, _) => {
                    match class {
                        ConnectionClass::Immortal => status.opening_immortal += 1,
                        ConnectionClass::Ephemeral => status.opening_ephemeral += 1,
                    }
                }
                Disposition::Available(_) | Disposition::Leased(_) => {}
            }
        }

        status
    }

    fn fire(&self, event: PoolEvent<U>) {
        self.listeners.notify(&event);
    }

    fn exception(&self, error: &Error) {
        self.hooks.exceptions.on_exception(error);
    }

    fn available(&mut self, class: ConnectionClass) -> &mut AvailableSlots<C> {
        match class {
            ConnectionClass::Immortal => &mut self.immortal,
            ConnectionClass::Ephemeral => &mut self.ephemeral,
        }
    }

    /// The connection handle for `id`, if the pool holds one.
    fn connection(&self, id: ConnectionId) -> Option<C> {
        match self.connections.get(&id)? {
            Disposition::Connecting(_) => None,
            Disposition::Establishing(_, connection) => Some(connection.clone()),
            Disposition::Available(ConnectionClass::Immortal) => self
                .immortal
                .iter()
                .find(|slot| slot.id() == id)
                .map(|slot| slot.connection().clone()),
            Disposition::Available(ConnectionClass::Ephemeral) => self
                .ephemeral
                .iter()
                .find(|slot| slot.id() == id)
                .map(|slot| slot.connection().clone()),
            Disposition::Leased(lease) => self
                .leased
                .get(lease)
                .map(|slot| slot.connection().clone()),
        }
    }

    // Starting and stopping

    async fn start(&mut self) -> Result<(), Error> {
        if self.shutting_down {
            return Err(Error::ShutdownRejected);
        }

        if self.started {
            return Ok(());
        }
        self.started = true;

        let deficit = self
            .config
            .immortal_count
            .saturating_sub(self.status().immortal_total());
        debug!(count = deficit, "opening immortal connections");

        for _ in 0..deficit {
            let (id, request) = self.prepare_open(ConnectionClass::Immortal);
            let result = self.connector.clone().oneshot(request).await;
            self.handle_opened(Opened { id, result });
        }

        // Establish hooks which complete right away have already queued their
        // results; handle them so connections are pooled before `Started`.
        while let Ok(signal) = self.signals.try_recv() {
            self.handle_signal(signal);
        }

        debug!("pool started");
        self.fire(PoolEvent::Started);
        Ok(())
    }

    fn stop(&mut self, force: bool, reply: oneshot::Sender<()>) {
        if self.stopped {
            let _ = reply.send(());
            return;
        }

        debug!(force, leased = self.leased.len(), "stopping pool");
        self.shutting_down = true;
        self.stop_waiters.push(reply);
        self.reject_pending();

        if force || self.leased.is_empty() {
            self.shutdown();
        }
    }

    fn reject_pending(&mut self) {
        let tasks: Vec<_> = self.ready.drain(..).chain(self.pending.drain()).collect();
        for task in tasks {
            trace!(request=%task.attempt().request, "rejecting pending request");
            let _ = task.fail(Error::ShutdownRejected);
        }
    }

    fn check_deferred_shutdown(&mut self) {
        if self.shutting_down && !self.stopped && self.leased.is_empty() {
            debug!("last lease returned, finishing shutdown");
            self.shutdown();
        }
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.shutting_down = true;
        self.reject_pending();

        let leased = std::mem::take(&mut self.leased);
        for slot in leased.into_values() {
            let id = slot.id();
            let (connection, class, _) = slot.into_parts();
            self.connections.remove(&id);
            connection.close();
            self.fire(PoolEvent::ConnectionClosed {
                connection: id,
                class,
            });
        }

        let available: Vec<_> = self.immortal.drain().chain(self.ephemeral.drain()).collect();
        for slot in available {
            let (id, class) = (slot.id(), slot.class());
            self.connections.remove(&id);
            slot.into_connection().close();
            self.fire(PoolEvent::ConnectionClosed {
                connection: id,
                class,
            });
        }

        // Connections still opening are closed when their attempt finishes.
        for (id, disposition) in self.connections.drain() {
            if let Disposition::Establishing(_, connection) = disposition {
                trace!(%id, "closing connection which was still establishing");
                connection.close();
            }
        }

        self.stopped = true;
        debug!("pool stopped");
        self.fire(PoolEvent::Stopped);
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // Lease requests

    fn run_ready(&mut self) {
        while let Some(task) = self.ready.pop_front() {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, task: LeaseTask<C, U>) {
        let step = task.run(self);

        // A grant is only announced once the lease reached its requester.
        let granted = self.granted.take();
        match step {
            Step::Deferred(task, requeue) => {
                trace!(request=%task.attempt().request, ?requeue, "lease request deferred");
                self.pending.defer(task, requeue);
                if std::mem::take(&mut self.rescan) {
                    self.wake_next();
                }
            }
            Step::Settled => {
                if let Some(event) = granted {
                    self.fire(event);
                }
            }
            Step::Undelivered(Ok(lease)) => {
                debug!(request=%lease.request(), id=%lease.id(), "lease requester is gone, returning connection");
                let _ = self.yield_lease(
                    lease.id(),
                    lease.lease_id(),
                    YieldReason::Canceled(lease.request()),
                );
            }
            Step::Undelivered(Err(error)) => {
                trace!("lease requester is gone: {error}");
            }
        }
    }

    /// Schedule the oldest pending request for another attempt.
    fn wake_next(&mut self) {
        if let Some(task) = self.pending.pop_front() {
            self.ready.push_back(task);
        }
    }

    /// Returns `true` while any connection attempt has not yet finished.
    fn is_opening(&self) -> bool {
        self.connections.values().any(|disposition| {
            matches!(
                disposition,
                Disposition::Connecting(_) | Disposition::Establishing(..)
            )
        })
    }

    fn cancel(&mut self, request: RequestId) {
        let matches = move |task: &LeaseTask<C, U>| task.attempt().request == request;
        let task = match self.pending.remove_where(matches) {
            Some(task) => Some(task),
            None => {
                let index = self.ready.iter().position(matches);
                index.and_then(|index| self.ready.remove(index))
            }
        };

        if let Some(task) = task {
            trace!(%request, "canceled while queued");
            self.fire(PoolEvent::LeaseCanceled {
                request,
                connection: None,
                correlation: task.attempt().correlation.clone(),
            });
            let _ = task.fail(Error::Canceled);
        }
    }

    /// Take the first usable candidate, immortal connections first.
    fn take_candidate(&mut self, now: Instant) -> Option<AvailableSlot<C>> {
        let status = self.status();

        for class in [ConnectionClass::Immortal, ConnectionClass::Ephemeral] {
            let pre_grant = &self.hooks.pre_grant;
            let slots = match class {
                ConnectionClass::Immortal => &mut self.immortal,
                ConnectionClass::Ephemeral => &mut self.ephemeral,
            };

            let Some(slot) =
                slots.take_first(|slot| pre_grant.pre_grant(slot, &status) == GrantDecision::Grant)
            else {
                continue;
            };

            if slot.is_usable(now) {
                return Some(slot);
            }

            debug!(id=%slot.id(), class=%slot.class(), "candidate expired or closed, discarding");
            self.connections.remove(&slot.id());
            let class = slot.class();
            self.closed(slot.id(), slot.into_connection(), class);

            // Retry promptly in case other candidates are still usable.
            self.rescan = true;
            return None;
        }

        None
    }

    fn grant(&mut self, attempt: &LeaseAttempt<U>) -> Grant<C, U> {
        let now = Instant::now();
        let Some(slot) = self.take_candidate(now) else {
            if !self.rescan {
                self.open_on_demand();
            }
            return Grant::Unavailable;
        };

        let (expiry, expired) = notify::channel();
        let leased = LeasedSlot::new(slot, now, attempt.duration, attempt.correlation.clone(), expiry);
        let (id, lease_id) = (leased.id(), leased.lease());

        if !attempt.state.grant() {
            debug!(request=%attempt.request, %id, "canceled during grant, returning connection");
            let (available, correlation) = leased.into_available(now, self.config.ephemeral_lifespan);
            self.connections
                .insert(id, Disposition::Available(available.class()));
            self.available(available.class()).push(available);
            self.fire(PoolEvent::LeaseCanceled {
                request: attempt.request,
                connection: Some(id),
                correlation,
            });
            self.wake_next();
            return Grant::Canceled;
        }

        let lease = Lease::new(&leased, attempt.request, expired, self.pool.clone());
        self.connections.insert(id, Disposition::Leased(lease_id));
        self.leased.insert(lease_id, leased);

        trace!(request=%attempt.request, %id, lease=%lease_id, "lease granted");
        self.granted = Some(PoolEvent::LeaseGranted {
            request: attempt.request,
            lease: lease_id,
            connection: id,
            correlation: attempt.correlation.clone(),
        });
        self.wake_next();
        Grant::Granted(lease)
    }

    fn yield_lease(
        &mut self,
        id: ConnectionId,
        lease: LeaseId,
        reason: YieldReason,
    ) -> Result<(), Error> {
        let current = match self.connections.get(&id) {
            Some(Disposition::Leased(current)) if *current == lease => self.leased.remove(&lease),
            Some(Disposition::Leased(_)) => {
                return self.protocol_error(ProtocolStateError::StaleLease {
                    connection: id,
                    lease,
                })
            }
            Some(_) => return self.protocol_error(ProtocolStateError::NotLeased(id)),
            None => return self.protocol_error(ProtocolStateError::Unknown(id)),
        };

        let Some(slot) = current else {
            return self.protocol_error(ProtocolStateError::Unknown(id));
        };

        let decision = self.hooks.pre_return.pre_return(slot.connection(), &self.status());
        let (available, correlation) = slot.into_available(Instant::now(), self.config.ephemeral_lifespan);
        let class = available.class();

        match reason {
            YieldReason::Released => self.fire(PoolEvent::LeaseYielded {
                lease,
                connection: id,
                correlation,
            }),
            YieldReason::Canceled(request) => self.fire(PoolEvent::LeaseCanceled {
                request,
                connection: Some(id),
                correlation,
            }),
        }

        match decision {
            ReturnDecision::Return => {
                trace!(%id, %class, "connection returned to pool");
                self.connections.insert(id, Disposition::Available(class));
                self.available(class).push(available);
            }
            ReturnDecision::Dispose => {
                debug!(%id, %class, "yielded connection disposed");
                self.connections.remove(&id);
                self.closed(id, available.into_connection(), class);
            }
        }

        self.wake_next();
        self.check_deferred_shutdown();
        Ok(())
    }

    fn protocol_error(&self, error: ProtocolStateError) -> Result<(), Error> {
        let error = Error::from(error);
        self.exception(&error);
        Err(error)
    }

    // Connection lifecycle

    /// Close a connection wherever it is. Returns `false` if there was nothing to close.
    fn close_connection(&mut self, id: ConnectionId) -> bool {
        let (connection, class) = match self.connections.remove(&id) {
            None => {
                trace!(%id, "close requested for unknown connection");
                return false;
            }
            Some(Disposition::Connecting(class)) => {
                // Closed when the attempt finishes.
                trace!(%id, "close requested while connecting");
                self.replace(class);
                return true;
            }
            Some(Disposition::Establishing(class, connection)) => {
                connection.close();
                self.replace(class);
                return true;
            }
            Some(Disposition::Available(class)) => {
                let Some(slot) = self.available(class).remove(id) else {
                    return false;
                };
                (slot.into_connection(), class)
            }
            Some(Disposition::Leased(lease)) => {
                let Some(slot) = self.leased.remove(&lease) else {
                    return false;
                };
                let (connection, class, _) = slot.into_parts();
                (connection, class)
            }
        };

        debug!(%id, %class, "closing connection");
        self.closed(id, connection, class);
        self.wake_next();
        self.check_deferred_shutdown();
        true
    }

    /// Close a connection which has already been removed from the pool's records.
    fn closed(&mut self, id: ConnectionId, connection: C, class: ConnectionClass) {
        connection.close();
        self.fire(PoolEvent::ConnectionClosed {
            connection: id,
            class,
        });
        self.replace(class);
    }

    fn replace(&mut self, class: ConnectionClass) {
        if class.is_immortal() && !self.shutting_down {
            debug!("replacing immortal connection");
            self.open(ConnectionClass::Immortal);
        }
    }

    /// Open a connection for a request which found nothing to lease.
    fn open_on_demand(&mut self) {
        if self.shutting_down {
            return;
        }

        let status = self.status();
        if status.immortal_total() < self.config.immortal_count {
            self.open(ConnectionClass::Immortal);
        } else if status.ephemeral_total() < self.config.max_ephemeral_count {
            self.open(ConnectionClass::Ephemeral);
        } else {
            trace!("pool at capacity, waiting for a connection");
        }
    }

    fn prepare_open(&mut self, class: ConnectionClass) -> (ConnectionId, ConnectRequest) {
        let id = ConnectionId::next();
        debug!(%id, %class, endpoint=%self.endpoint, "opening connection");
        self.connections.insert(id, Disposition::Connecting(class));

        let request = ConnectRequest {
            id,
            class,
            endpoint: self.endpoint.clone(),
            handler_name: self.handler_name.clone(),
            notifier: ConnectionNotifier::new(id, self.signals_tx.clone()),
        };
        (id, request)
    }

    fn open(&mut self, class: ConnectionClass) {
        let (id, request) = self.prepare_open(class);
        let connector = self.connector.clone();
        let opened = self.opened_tx.clone();

        tokio::spawn(async move {
            let result = connector.oneshot(request).await;
            if let Err(mpsc::error::SendError(Opened {
                result: Ok(connection),
                ..
            })) = opened.send(Opened { id, result })
            {
                connection.close();
            }
        });
    }

    fn handle_opened(&mut self, opened: Opened<C>) {
        let Opened { id, result } = opened;

        let class = match self.connections.get(&id) {
            Some(Disposition::Connecting(class)) => *class,
            _ => {
                trace!(%id, "connection no longer wanted");
                if let Ok(connection) = result {
                    connection.close();
                }
                return;
            }
        };

        match result {
            Ok(connection) => {
                trace!(%id, %class, "connected, establishing");
                self.connections
                    .insert(id, Disposition::Establishing(class, connection.clone()));
                let done = Established::new(id, self.signals_tx.clone());
                self.hooks.establish.establish(&connection, done);
            }
            Err(error) => {
                debug!(%id, %class, "connection failed: {error}");
                self.connections.remove(&id);
                self.exception(&Error::Connect(error));
            }
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Established(id, result) => self.handle_established(id, result),
            Signal::Transport(id, event) => self.handle_transport(id, event),
        }
    }

    fn handle_established(&mut self, id: ConnectionId, result: Result<(), BoxError>) {
        let (class, connection) = match self.connections.remove(&id) {
            Some(Disposition::Establishing(class, connection)) => (class, connection),
            Some(other) => {
                self.connections.insert(id, other);
                return;
            }
            None => return,
        };

        match result {
            Ok(()) => {
                debug!(%id, %class, "connection established");
                self.connections.insert(id, Disposition::Available(class));
                let slot = AvailableSlot::new(
                    id,
                    connection,
                    class,
                    Instant::now(),
                    self.config.ephemeral_lifespan,
                );
                self.available(class).push(slot);
                self.fire(PoolEvent::ConnectionCreated {
                    connection: id,
                    class,
                });
                self.wake_next();
            }
            Err(error) => {
                debug!(%id, %class, "establish failed: {error}");
                connection.close();
                self.exception(&Error::Establish(error));
            }
        }
    }

    fn handle_transport(&mut self, id: ConnectionId, event: TransportEvent) {
        let Some(connection) = self.connection(id) else {
            trace!(%id, ?event, "transport event for unknown connection");
            return;
        };

        let fault = match event {
            TransportEvent::Inactive => Fault::Inactive,
            TransportEvent::WritabilityChanged => {
                if connection.is_open() && connection.is_writable() {
                    trace!(%id, "connection writable again");
                    return;
                }
                Fault::Unwritable
            }
            TransportEvent::Error(error) => Fault::Io(error),
        };

        let decision = self.hooks.on_fault.on_fault(&connection, &fault, &self.status());
        trace!(%id, %fault, ?decision, "transport fault");

        if decision == FaultDecision::Close {
            self.close_connection(id);
        }

        if let Fault::Io(error) = fault {
            self.exception(&Error::Transport(error));
        }
    }

    // Reaping

    fn reap(&mut self) {
        let now = Instant::now();
        let selected = {
            let snapshot: Vec<&LeasedSlot<C, U>> = self.leased.values().collect();
            self.reaper.reap(&snapshot, now)
        };

        let status = self.status();
        let mut closed = 0;

        for lease in selected {
            let Some(slot) = self.leased.get(&lease) else {
                continue;
            };

            if self.hooks.on_expired.on_lease_expired(slot, &status) == ExpiryDecision::Keep {
                trace!(%lease, "expired lease kept");
                continue;
            }

            let Some(slot) = self.leased.remove(&lease) else {
                continue;
            };

            let id = slot.id();
            debug!(%id, %lease, "lease expired");
            self.connections.remove(&id);
            slot.signal_expired();
            let (connection, class, correlation) = slot.into_parts();
            self.fire(PoolEvent::LeaseExpired {
                lease,
                connection: id,
                correlation,
            });
            self.closed(id, connection, class);
            closed += 1;
        }

        for slot in self.ephemeral.take_expired(now) {
            let id = slot.id();
            debug!(%id, "ephemeral connection aged out");
            self.connections.remove(&id);
            self.fire(PoolEvent::EphemeralReaped { connection: id });
            self.closed(id, slot.into_connection(), ConnectionClass::Ephemeral);
            closed += 1;
        }

        if closed > 0 {
            self.wake_next();
            self.check_deferred_shutdown();
        } else if !self.is_opening() {
            // Nothing is on its way to the oldest waiter, so let it try again.
            self.wake_next();
        }
    }
}

impl<C, U> Attempt<Engine<C, U>> for LeaseAttempt<U>
where
    C: Connection,
    U: Clone + Send + Sync + 'static,
{
    type Output = Lease<C, U>;
    type Error = Error;

    fn attempt(&mut self, engine: &mut Engine<C, U>, first: bool) -> Outcome<Lease<C, U>, Error> {
        if self.state.is_canceled() {
            engine.fire(PoolEvent::LeaseCanceled {
                request: self.request,
                connection: None,
                correlation: self.correlation.clone(),
            });
            return Outcome::Fail(Error::Canceled);
        }

        if engine.shutting_down {
            return Outcome::Fail(Error::ShutdownRejected);
        }

        if first && !engine.pending.is_empty() {
            trace!(request=%self.request, waiting=engine.pending.len(), "queued behind older requests");

            // New demand restarts the oldest waiter when no connection is
            // being opened for it, e.g. after a failed connect.
            if !engine.is_opening() {
                engine.rescan = true;
            }
            return Outcome::Retry(Requeue::Back);
        }

        match engine.grant(self) {
            Grant::Granted(lease) => Outcome::Complete(lease),
            Grant::Canceled => Outcome::Fail(Error::Canceled),
            Grant::Unavailable => Outcome::Retry(Requeue::Front),
        }
    }
}
