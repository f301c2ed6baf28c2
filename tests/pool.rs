use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lifeguard::hooks::{Established, GrantDecision, ReturnDecision};
use lifeguard::mock::{MockConnection, MockConnector};
use lifeguard::slot::AvailableSlot;
use lifeguard::{
    Builder, Connection, ConnectionClass, Error, EventKind, Pool, PoolEvent, PoolStatus,
};
use tokio::sync::{mpsc, oneshot};

type Events = mpsc::UnboundedReceiver<PoolEvent<u32>>;

const LONG: Duration = Duration::from_secs(3600);

fn builder(connector: &MockConnector) -> (Builder<MockConnection, u32>, Events) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (tx, rx) = mpsc::unbounded_channel();
    let builder = Pool::builder()
        .with_endpoint("mock://pool.test:1887".parse().unwrap())
        .with_connector(connector.clone())
        .with_listener(move |event: &PoolEvent<u32>| {
            let _ = tx.send(event.clone());
        });

    (builder, rx)
}

fn exceptions<C, U>(builder: Builder<C, U>) -> (Builder<C, U>, mpsc::UnboundedReceiver<String>)
where
    C: Connection,
    U: Clone + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let builder = builder.with_pool_exception_handler(move |error: &Error| {
        let kind = match error {
            Error::Connect(_) => "connect",
            Error::Establish(_) => "establish",
            Error::Transport(_) => "transport",
            Error::ProtocolState(_) => "protocol",
            _ => "other",
        };
        let _ = tx.send(kind.to_owned());
    });
    (builder, rx)
}

/// Wait for the next event of `kind`, skipping any others.
async fn expect(events: &mut Events, kind: EventKind) -> PoolEvent<u32> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
            .expect("event stream closed");
        if event.kind() == kind {
            return event;
        }
    }
}

async fn snapshot(pool: &Pool<MockConnection, u32>) -> PoolStatus {
    pool.status().await.expect("pool is running")
}

#[tokio::test(start_paused = true)]
async fn start_opens_immortal_connections() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(3)
        .with_max_ephemeral_count(2)
        .build()
        .unwrap();

    pool.start().await.unwrap();

    for _ in 0..3 {
        let event = expect(&mut events, EventKind::ConnectionCreated).await;
        assert!(matches!(
            event,
            PoolEvent::ConnectionCreated {
                class: ConnectionClass::Immortal,
                ..
            }
        ));
    }
    expect(&mut events, EventKind::Started).await;

    let status = snapshot(&pool).await;
    assert_eq!(status.available_immortal, 3);
    assert_eq!(status.available_ephemeral, 0);
    assert_eq!(status.immortal_total(), 3);
    assert_eq!(connector.connects(), 3);

    // Starting again is a no-op.
    pool.start().await.unwrap();
    assert_eq!(connector.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn lease_and_release() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(LONG, 7).await.unwrap();
    assert_eq!(lease.origin(), ConnectionClass::Immortal);
    assert_eq!(*lease.correlation(), 7);
    assert!(lease.is_open());
    assert!(!lease.is_expired());

    let event = expect(&mut events, EventKind::LeaseRequested).await;
    assert!(matches!(
        event,
        PoolEvent::LeaseRequested { correlation: 7, .. }
    ));

    let event = expect(&mut events, EventKind::LeaseGranted).await;
    match event {
        PoolEvent::LeaseGranted {
            request,
            lease: lease_id,
            connection,
            correlation,
        } => {
            assert_eq!(request, lease.request());
            assert_eq!(lease_id, lease.lease_id());
            assert_eq!(connection, lease.id());
            assert_eq!(correlation, 7);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let status = snapshot(&pool).await;
    assert_eq!(status.leased, 1);
    assert_eq!(status.leased_immortal, 1);
    assert_eq!(status.available(), 0);

    let id = lease.id();
    lease.release().await.unwrap();

    let event = expect(&mut events, EventKind::LeaseYielded).await;
    assert_eq!(event.connection(), Some(id));

    let status = snapshot(&pool).await;
    assert_eq!(status.leased, 0);
    assert_eq!(status.available_immortal, 1);
}

#[tokio::test(start_paused = true)]
async fn yield_through_pool_handle() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(LONG, 1).await.unwrap();
    pool.yield_lease(lease).await.unwrap();
    assert_eq!(snapshot(&pool).await.available_immortal, 1);
}

#[tokio::test(start_paused = true)]
async fn closed_immortal_is_replaced() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let original = connector.opened()[0].clone();
    pool.close_connection(original.id());

    let event = expect(&mut events, EventKind::ConnectionClosed).await;
    assert_eq!(event.connection(), Some(original.id()));
    assert!(!original.is_open());
    assert_eq!(original.close_count(), 1);

    let event = expect(&mut events, EventKind::ConnectionCreated).await;
    let replacement = event.connection().unwrap();
    assert_ne!(replacement, original.id());
    assert_eq!(connector.connects(), 2);

    let lease = pool.lease(LONG, 0).await.unwrap();
    assert_eq!(lease.id(), replacement);
}

#[tokio::test(start_paused = true)]
async fn ephemeral_connections_open_on_demand() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_max_ephemeral_count(1)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let first = pool.lease(LONG, 1).await.unwrap();
    assert_eq!(first.origin(), ConnectionClass::Immortal);

    let second = pool.lease(LONG, 2).await.unwrap();
    assert_eq!(second.origin(), ConnectionClass::Ephemeral);
    let event = expect(&mut events, EventKind::ConnectionCreated).await;
    assert!(matches!(
        event,
        PoolEvent::ConnectionCreated {
            class: ConnectionClass::Immortal,
            ..
        }
    ));
    let event = expect(&mut events, EventKind::ConnectionCreated).await;
    assert_eq!(event.connection(), Some(second.id()));

    // The pool is full, so the third request waits.
    let mut third = pool.lease_async(LONG, 3);
    let err = third.wait_timeout(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));

    let status = snapshot(&pool).await;
    assert_eq!(status.pending, 1);
    assert_eq!(status.leased, 2);
    assert_eq!(status.ephemeral_total(), 1);
    assert_eq!(connector.connects(), 2);

    let id = first.id();
    first.release().await.unwrap();
    let third = third.await.unwrap();
    assert_eq!(third.id(), id);
    assert_eq!(*third.correlation(), 3);
}

#[tokio::test(start_paused = true)]
async fn single_connection_is_handed_over_on_yield() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_max_ephemeral_count(0)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let first = pool.lease(LONG, 1).await.unwrap();
    let mut second = pool.lease_async(LONG, 2);
    assert!(matches!(
        second.wait_timeout(Duration::from_millis(100)).await,
        Err(Error::Timeout)
    ));

    let id = first.id();
    first.release().await.unwrap();

    let second = second
        .wait_timeout(Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn requests_are_granted_in_order() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_max_ephemeral_count(0)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let held = pool.lease(LONG, 0).await.unwrap();
    let mut waiting: Vec<_> = (1..=3).map(|n| pool.lease_async(LONG, n)).collect();
    assert_eq!(snapshot(&pool).await.pending, 3);

    held.release().await.unwrap();
    for (expected, future) in (1..=3).zip(waiting.iter_mut()) {
        let lease = future.await.unwrap();
        assert_eq!(*lease.correlation(), expected);
        lease.release().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn idle_ephemeral_connections_are_reaped() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(0)
        .with_max_ephemeral_count(1)
        .with_ephemeral_lifespan(Duration::from_secs(30))
        .with_reaper_interval(Duration::from_secs(10))
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(LONG, 1).await.unwrap();
    assert_eq!(lease.origin(), ConnectionClass::Ephemeral);
    let id = lease.id();
    lease.release().await.unwrap();
    assert_eq!(snapshot(&pool).await.available_ephemeral, 1);

    let event = expect(&mut events, EventKind::EphemeralReaped).await;
    assert_eq!(event.connection(), Some(id));
    let event = expect(&mut events, EventKind::ConnectionClosed).await;
    assert!(matches!(
        event,
        PoolEvent::ConnectionClosed {
            class: ConnectionClass::Ephemeral,
            ..
        }
    ));

    assert_eq!(snapshot(&pool).await.available_ephemeral, 0);
    assert!(!connector.connection(id).unwrap().is_open());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn overdue_leases_are_expired() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let (builder, mut errors) = exceptions(builder);
    let pool = builder
        .with_immortal_count(1)
        .with_reaper_interval(Duration::from_secs(10))
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(Duration::from_secs(5), 9).await.unwrap();
    let id = lease.id();

    let event = expect(&mut events, EventKind::LeaseExpired).await;
    assert!(matches!(
        event,
        PoolEvent::LeaseExpired { correlation: 9, .. }
    ));
    assert_eq!(event.connection(), Some(id));

    let event = expect(&mut events, EventKind::ConnectionClosed).await;
    assert_eq!(event.connection(), Some(id));
    let event = expect(&mut events, EventKind::ConnectionCreated).await;
    assert_ne!(event.connection(), Some(id));

    assert!(lease.is_expired());
    assert!(lease.expired().await);
    assert!(!lease.is_open());

    let err = lease.release().await.unwrap_err();
    assert!(err.is_protocol_state());
    assert_eq!(errors.recv().await.as_deref(), Some("protocol"));
}

#[tokio::test(start_paused = true)]
async fn cancel_before_grant() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_max_ephemeral_count(0)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let held = pool.lease(LONG, 1).await.unwrap();
    let mut waiting = pool.lease_async(LONG, 2);
    assert!(matches!(
        waiting.wait_timeout(Duration::from_millis(10)).await,
        Err(Error::Timeout)
    ));

    assert!(waiting.cancel());
    assert!(!waiting.cancel());
    assert!(matches!(waiting.await, Err(Error::Canceled)));

    let event = expect(&mut events, EventKind::LeaseCanceled).await;
    assert!(matches!(
        event,
        PoolEvent::LeaseCanceled {
            connection: None,
            correlation: 2,
            ..
        }
    ));

    held.release().await.unwrap();
    let status = snapshot(&pool).await;
    assert_eq!(status.pending, 0);
    assert_eq!(status.available_immortal, 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_granted_future_returns_connection() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let future = pool.lease_async(LONG, 4);
    let granted = expect(&mut events, EventKind::LeaseGranted).await;
    drop(future);

    let event = expect(&mut events, EventKind::LeaseCanceled).await;
    assert!(matches!(
        event,
        PoolEvent::LeaseCanceled {
            connection: Some(_),
            correlation: 4,
            ..
        }
    ));
    assert_eq!(event.connection(), granted.connection());

    let status = snapshot(&pool).await;
    assert_eq!(status.leased, 0);
    assert_eq!(status.available_immortal, 1);
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_waits_for_leases() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder.with_immortal_count(2).build().unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(LONG, 1).await.unwrap();

    let stopping = tokio::spawn({
        let pool = pool.clone();
        async move { pool.stop(false).await }
    });
    while !pool.is_shutting_down() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        pool.lease(LONG, 2).await,
        Err(Error::ShutdownRejected)
    ));

    let status = snapshot(&pool).await;
    assert!(status.shutting_down);
    assert!(!status.stopped);
    assert_eq!(status.leased, 1);
    assert!(lease.is_open());

    lease.release().await.unwrap();
    stopping.await.unwrap().unwrap();
    expect(&mut events, EventKind::Stopped).await;

    assert!(snapshot(&pool).await.stopped);
    for conn in connector.opened() {
        assert!(!conn.is_open());
    }

    // Restarting a stopped pool is refused.
    assert!(matches!(pool.start().await, Err(Error::ShutdownRejected)));
}

#[tokio::test(start_paused = true)]
async fn forced_stop_closes_leased_connections() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(LONG, 1).await.unwrap();
    pool.stop(true).await.unwrap();

    assert!(!lease.is_open());
    assert!(!lease.expired().await);

    let err = lease.release().await.unwrap_err();
    assert!(err.is_protocol_state());

    // Stopping twice is fine.
    pool.stop(true).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropping_the_pool_closes_connections() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder.with_immortal_count(2).build().unwrap();
    pool.start().await.unwrap();

    drop(pool);
    expect(&mut events, EventKind::Stopped).await;
    for conn in connector.opened() {
        assert!(!conn.is_open());
    }
}

#[tokio::test(start_paused = true)]
async fn transport_faults_close_connections() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let (builder, mut errors) = exceptions(builder);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let conn = connector.opened()[0].clone();
    let notifier = connector.notifier(conn.id()).unwrap();

    // Still writable: nothing happens.
    notifier.writability_changed();
    assert_eq!(snapshot(&pool).await.available_immortal, 1);
    assert!(conn.is_open());

    conn.set_writable(false);
    notifier.writability_changed();
    let event = expect(&mut events, EventKind::ConnectionClosed).await;
    assert_eq!(event.connection(), Some(conn.id()));

    let replacement = expect(&mut events, EventKind::ConnectionCreated)
        .await
        .connection()
        .unwrap();
    connector
        .notifier(replacement)
        .unwrap()
        .error(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
    let event = expect(&mut events, EventKind::ConnectionClosed).await;
    assert_eq!(event.connection(), Some(replacement));
    assert_eq!(errors.recv().await.as_deref(), Some("transport"));

    let replacement = expect(&mut events, EventKind::ConnectionCreated)
        .await
        .connection()
        .unwrap();
    connector.notifier(replacement).unwrap().inactive();
    let event = expect(&mut events, EventKind::ConnectionClosed).await;
    assert_eq!(event.connection(), Some(replacement));
}

#[tokio::test(start_paused = true)]
async fn tolerated_faults_keep_connections() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_context_exception_handler(
            |_: &MockConnection, _: &lifeguard::conn::Fault, _: &PoolStatus| {
                lifeguard::hooks::FaultDecision::Tolerate
            },
        )
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let conn = connector.opened()[0].clone();
    connector.notifier(conn.id()).unwrap().inactive();

    assert_eq!(snapshot(&pool).await.available_immortal, 1);
    assert!(conn.is_open());
}

#[tokio::test(start_paused = true)]
async fn connect_failures_are_reported() {
    let connector = MockConnector::failing();
    let (builder, _events) = builder(&connector);
    let (builder, mut errors) = exceptions(builder);
    let pool = builder.with_immortal_count(2).build().unwrap();

    pool.start().await.unwrap();
    assert_eq!(errors.recv().await.as_deref(), Some("connect"));
    assert_eq!(errors.recv().await.as_deref(), Some("connect"));

    let status = snapshot(&pool).await;
    assert_eq!(status.immortal_total(), 0);
    assert_eq!(connector.connects(), 2);

    // Demand restores the missing immortal connections.
    connector.set_failing(false);
    let lease = pool.lease(LONG, 1).await.unwrap();
    assert_eq!(lease.origin(), ConnectionClass::Immortal);
}

#[tokio::test(start_paused = true)]
async fn queued_request_recovers_after_connect_failure() {
    let connector = MockConnector::failing();
    let (builder, _events) = builder(&connector);
    let (builder, mut errors) = exceptions(builder);
    let pool = builder
        .with_immortal_count(0)
        .with_max_ephemeral_count(1)
        .with_reaper_interval(LONG * 24)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let first = pool.lease_async(LONG, 1);
    assert_eq!(errors.recv().await.as_deref(), Some("connect"));
    let status = snapshot(&pool).await;
    assert_eq!(status.pending, 1);
    assert_eq!(status.opening_ephemeral, 0);

    // The next request opens a connection for the oldest waiter.
    connector.set_failing(false);
    let second = pool.lease_async(LONG, 2);
    let lease = first.await.unwrap();
    assert_eq!(*lease.correlation(), 1);
    assert_eq!(connector.connects(), 2);

    lease.release().await.unwrap();
    let lease = second.await.unwrap();
    assert_eq!(*lease.correlation(), 2);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn reaper_retries_after_connect_failure() {
    let connector = MockConnector::failing();
    let (builder, _events) = builder(&connector);
    let (builder, mut errors) = exceptions(builder);
    let pool = builder
        .with_immortal_count(0)
        .with_max_ephemeral_count(1)
        .with_reaper_interval(Duration::from_secs(10))
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let waiting = pool.lease_async(LONG, 1);
    assert_eq!(errors.recv().await.as_deref(), Some("connect"));
    connector.set_failing(false);

    let lease = waiting.await.unwrap();
    assert_eq!(lease.origin(), ConnectionClass::Ephemeral);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn queued_request_recovers_after_failed_establish() {
    let refuse = Arc::new(AtomicBool::new(true));
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let (builder, mut errors) = exceptions(builder);
    let pool = builder
        .with_immortal_count(0)
        .with_max_ephemeral_count(1)
        .with_reaper_interval(LONG * 24)
        .with_post_connect_establish({
            let refuse = refuse.clone();
            move |_: &MockConnection, done: Established| {
                if refuse.load(Ordering::SeqCst) {
                    done.fail("handshake refused");
                } else {
                    done.complete();
                }
            }
        })
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let first = pool.lease_async(LONG, 1);
    assert_eq!(errors.recv().await.as_deref(), Some("establish"));
    assert_eq!(connector.opened()[0].close_count(), 1);

    refuse.store(false, Ordering::SeqCst);
    let _second = pool.lease_async(LONG, 2);
    let lease = first.await.unwrap();
    assert_eq!(*lease.correlation(), 1);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn closed_candidate_is_replaced_and_request_served() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_max_ephemeral_count(0)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let stale = connector.opened()[0].clone();
    stale.drop_remote();

    let lease = pool.lease(LONG, 1).await.unwrap();
    assert_ne!(lease.id(), stale.id());
    assert_eq!(lease.origin(), ConnectionClass::Immortal);
    assert_eq!(stale.close_count(), 1);

    let closed = expect(&mut events, EventKind::ConnectionClosed).await;
    assert_eq!(closed.connection(), Some(stale.id()));
    let created = expect(&mut events, EventKind::ConnectionCreated).await;
    assert_eq!(created.connection(), Some(lease.id()));

    let status = snapshot(&pool).await;
    assert_eq!(status.immortal_total(), 1);
    assert_eq!(status.pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_granted_in_order() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(2)
        .with_max_ephemeral_count(0)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let held = [
        pool.lease(LONG, 0).await.unwrap(),
        pool.lease(LONG, 0).await.unwrap(),
    ];
    let waiting: Vec<_> = (1..=8).map(|n| pool.lease_async(LONG, n)).collect();
    assert_eq!(snapshot(&pool).await.pending, 8);

    let workers: Vec<_> = waiting
        .into_iter()
        .map(|future| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = future.await.unwrap();
                let status = snapshot(&pool).await;
                assert!(status.leased <= 2);
                assert_eq!(
                    status.leased + status.available_immortal + status.opening_immortal,
                    2
                );
                tokio::task::yield_now().await;
                lease.release().await.unwrap();
            })
        })
        .collect();

    for lease in held {
        lease.release().await.unwrap();
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let mut granted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::LeaseGranted { correlation, .. } = event {
            granted.push(correlation);
        }
    }
    assert_eq!(granted, vec![0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test(start_paused = true)]
async fn asynchronous_establish() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_max_ephemeral_count(0)
        .with_post_connect_establish(|_: &MockConnection, done: Established| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                done.complete();
            });
        })
        .build()
        .unwrap();

    pool.start().await.unwrap();
    let status = snapshot(&pool).await;
    assert_eq!(status.opening_immortal, 1);
    assert_eq!(status.available_immortal, 0);

    // A request made while establishing waits for the connection.
    let lease = pool.lease(LONG, 1).await.unwrap();
    let created = expect(&mut events, EventKind::ConnectionCreated).await;
    assert_eq!(created.connection(), Some(lease.id()));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_establish_closes_connection() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let (builder, mut errors) = exceptions(builder);
    let pool = builder
        .with_immortal_count(1)
        .with_post_connect_establish(|_: &MockConnection, done: Established| {
            done.fail("handshake refused");
        })
        .build()
        .unwrap();

    pool.start().await.unwrap();
    assert_eq!(errors.recv().await.as_deref(), Some("establish"));

    let status = snapshot(&pool).await;
    assert_eq!(status.immortal_total(), 0);
    assert_eq!(connector.opened()[0].close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn pre_grant_hook_skips_candidates() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_max_ephemeral_count(1)
        .with_pre_grant(|slot: &AvailableSlot<MockConnection>, _: &PoolStatus| {
            if slot.class().is_immortal() {
                GrantDecision::Skip
            } else {
                GrantDecision::Grant
            }
        })
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(LONG, 1).await.unwrap();
    assert_eq!(lease.origin(), ConnectionClass::Ephemeral);

    let status = snapshot(&pool).await;
    assert_eq!(status.available_immortal, 1);
}

#[tokio::test(start_paused = true)]
async fn pre_return_hook_disposes_connections() {
    let connector = MockConnector::new();
    let (builder, mut events) = builder(&connector);
    let pool = builder
        .with_immortal_count(1)
        .with_pre_return(|_: &MockConnection, _: &PoolStatus| ReturnDecision::Dispose)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let lease = pool.lease(LONG, 1).await.unwrap();
    let id = lease.id();
    lease.release().await.unwrap();

    expect(&mut events, EventKind::LeaseYielded).await;
    let closed = expect(&mut events, EventKind::ConnectionClosed).await;
    assert_eq!(closed.connection(), Some(id));
    let created = expect(&mut events, EventKind::ConnectionCreated).await;
    assert_ne!(created.connection(), Some(id));
}

#[tokio::test(start_paused = true)]
async fn lease_with_listener() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let (tx, rx) = oneshot::channel();
    let handle = pool.lease_with_listener(LONG, 3, move |result| {
        let _ = tx.send(result);
    });
    assert!(handle.request().is_some());

    let lease = rx.await.unwrap().unwrap();
    assert_eq!(*lease.correlation(), 3);
    assert_eq!(Some(lease.request()), handle.request());
    assert!(!handle.cancel());
    lease.release().await.unwrap();

    pool.stop(false).await.unwrap();

    let (tx, mut rx) = oneshot::channel();
    let handle = pool.lease_with_listener(LONG, 4, move |result| {
        let _ = tx.send(result);
    });
    assert!(handle.request().is_none());
    assert!(matches!(rx.try_recv(), Ok(Err(Error::ShutdownRejected))));
}

#[tokio::test(start_paused = true)]
async fn listeners_can_be_removed() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = pool.add_listener(move |event: &PoolEvent<u32>| {
        let _ = tx.send(event.kind());
    });
    pool.start().await.unwrap();
    assert_eq!(rx.recv().await, Some(EventKind::ConnectionCreated));
    assert_eq!(rx.recv().await, Some(EventKind::Started));

    assert!(pool.remove_listener(id));
    assert!(!pool.remove_listener(id));

    let lease = pool.lease(LONG, 1).await.unwrap();
    lease.release().await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_lease() {
    let connector = MockConnector::new();
    let (builder, _events) = builder(&connector);
    let pool = builder.with_immortal_count(1).build().unwrap();
    pool.start().await.unwrap();

    let lease = tokio::task::spawn_blocking({
        let pool = pool.clone();
        move || pool.blocking_lease(LONG, 5)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(*lease.correlation(), 5);
    lease.release().await.unwrap();
}
