//! Client subscriptions against a real-time server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uasub::node_id::well_known;
use uasub::subscription::{CloseReason, MonitoringParameters, SubscriptionParameters};
use uasub::{
    ClientSession, ClientSubscription, DataType, InMemoryAddressSpace, NodeId, Server, ServerConfig,
    SubscriptionEvent, SubscriptionLimits, SystemClock, TimerThread, UserIdentity, Variable, Variant,
};

const WAIT: Duration = Duration::from_secs(5);

struct Live {
    server: Arc<Server>,
    _timers: TimerThread,
    setpoint: NodeId,
    other: NodeId,
}

fn live() -> Live {
    let config = ServerConfig {
        limits: SubscriptionLimits {
            min_publishing_interval_ms: 10,
            min_sampling_interval_ms: 5,
            ..SubscriptionLimits::default()
        },
        ..ServerConfig::default()
    };

    let space = Arc::new(InMemoryAddressSpace::new());
    let setpoint = NodeId::string(1, "setpoint");
    let other = NodeId::string(1, "other");
    for (id, name) in [(&setpoint, "Setpoint"), (&other, "Other")] {
        space
            .add_variable(
                &well_known::OBJECTS_FOLDER,
                Variable::builder(id.clone(), name, DataType::Double)
                    .value(Variant::Double(10.0))
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }

    let server = Arc::new(Server::new(config, space, Arc::new(SystemClock::new())).unwrap());
    let timers = server.spawn_timer_thread().unwrap();
    Live {
        server,
        _timers: timers,
        setpoint,
        other,
    }
}

fn fast_params() -> SubscriptionParameters {
    SubscriptionParameters {
        publishing_interval: Duration::from_millis(20),
        lifetime_count: 1000,
        max_keep_alive_count: 5,
        max_notifications_per_publish: 0,
        publishing_enabled: true,
        priority: 0,
    }
}

fn fast_item(handle: u32) -> MonitoringParameters {
    MonitoringParameters::new(handle).with_sampling_interval(Duration::from_millis(10))
}

fn wait_for_termination(sub: &ClientSubscription) -> CloseReason {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Ok(SubscriptionEvent::Terminated { reason }) = sub.next_event_timeout(Duration::from_millis(100)) {
            return reason;
        }
    }
    panic!("subscription did not terminate");
}

#[test]
fn test_changes_reach_the_item_stream_in_order() {
    let live = live();
    let client = ClientSession::from(live.server.create_session(&UserIdentity::Anonymous).unwrap())
        .with_publish_poll(Duration::from_millis(20));
    let sub = client.subscribe(&fast_params()).unwrap();
    assert_eq!(
        sub.next_event_timeout(WAIT).unwrap(),
        SubscriptionEvent::Started { subscription_id: sub.id() }
    );

    let item = sub.monitor(&live.setpoint, fast_item(0)).unwrap();
    let first = item.changes().recv_timeout(WAIT).unwrap();
    assert_eq!(first.value.value, Variant::Double(10.0));
    assert!(!first.overflow);

    for v in [11.0, 12.0, 13.0] {
        client.write(&live.setpoint, v).unwrap();
        let change = item.changes().recv_timeout(WAIT).unwrap();
        assert_eq!(change.value.value, Variant::Double(v));
    }
}

#[test]
fn test_client_handles_route_each_item_separately() {
    let live = live();
    let client = ClientSession::from(live.server.create_session(&UserIdentity::Anonymous).unwrap())
        .with_publish_poll(Duration::from_millis(20));
    let sub = client.subscribe(&fast_params()).unwrap();

    let a = sub.monitor(&live.setpoint, fast_item(0)).unwrap();
    let b = sub.monitor(&live.other, fast_item(0)).unwrap();
    assert_ne!(a.client_handle(), b.client_handle());

    a.changes().recv_timeout(WAIT).unwrap();
    b.changes().recv_timeout(WAIT).unwrap();

    client.write(&live.other, 99.0).unwrap();
    assert_eq!(b.changes().recv_timeout(WAIT).unwrap().value.value, Variant::Double(99.0));
    assert!(a.changes().try_recv().is_none());
}

#[test]
fn test_monitor_unknown_node_fails() {
    let live = live();
    let client = ClientSession::from(live.server.create_session(&UserIdentity::Anonymous).unwrap());
    let sub = client.subscribe(&fast_params()).unwrap();

    let err = sub.monitor(&NodeId::string(1, "nope"), fast_item(0)).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_keep_alive_events_while_idle() {
    let live = live();
    let client = ClientSession::from(live.server.create_session(&UserIdentity::Anonymous).unwrap())
        .with_publish_poll(Duration::from_millis(20));
    let sub = client
        .subscribe(&SubscriptionParameters {
            max_keep_alive_count: 2,
            ..fast_params()
        })
        .unwrap();

    assert!(matches!(sub.next_event_timeout(WAIT).unwrap(), SubscriptionEvent::Started { .. }));
    assert!(matches!(sub.next_event_timeout(WAIT).unwrap(), SubscriptionEvent::KeepAlive { .. }));
}

#[test]
fn test_terminate_emits_single_event_and_closes_streams() {
    let live = live();
    let session = live.server.create_session(&UserIdentity::Anonymous).unwrap();
    let client = ClientSession::from(Arc::clone(&session)).with_publish_poll(Duration::from_millis(20));
    let sub = client.subscribe(&fast_params()).unwrap();
    let item = sub.monitor(&live.setpoint, fast_item(0)).unwrap();
    item.changes().recv_timeout(WAIT).unwrap();

    sub.terminate().unwrap();
    sub.terminate().unwrap();
    assert!(sub.is_terminated());

    let terminations: Vec<CloseReason> = sub
        .events()
        .try_iter()
        .filter_map(|e| match e {
            SubscriptionEvent::Terminated { reason } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(terminations, vec![CloseReason::Deleted]);

    assert!(session.subscription(sub.id()).unwrap_err().is_not_found());
    item.changes().drain();
    assert!(item.changes().recv_timeout(WAIT).unwrap_err().is_transport());
}

#[test]
fn test_session_close_terminates_subscription() {
    let live = live();
    let session = live.server.create_session(&UserIdentity::Anonymous).unwrap();
    let client = ClientSession::from(Arc::clone(&session)).with_publish_poll(Duration::from_millis(20));
    let sub = client.subscribe(&fast_params()).unwrap();

    live.server.close_session(session.id()).unwrap();
    assert_eq!(wait_for_termination(&sub), CloseReason::SessionClosed);
}

#[test]
fn test_disconnect_terminates_subscription() {
    let live = live();
    let session = live.server.create_session(&UserIdentity::Anonymous).unwrap();
    let client = ClientSession::from(Arc::clone(&session)).with_publish_poll(Duration::from_millis(20));
    let sub = client.subscribe(&fast_params()).unwrap();
    let item = sub.monitor(&live.setpoint, fast_item(0)).unwrap();

    session.disconnect("cable pulled").unwrap();
    assert_eq!(wait_for_termination(&sub), CloseReason::Disconnected);
    assert!(client.read(&live.setpoint).unwrap_err().is_transport());

    item.changes().drain();
    assert!(item.changes().recv_timeout(WAIT).unwrap_err().is_transport());
}

#[test]
fn test_deleted_item_stops_receiving() {
    let live = live();
    let client = ClientSession::from(live.server.create_session(&UserIdentity::Anonymous).unwrap())
        .with_publish_poll(Duration::from_millis(20));
    let sub = client.subscribe(&fast_params()).unwrap();
    let item = sub.monitor(&live.setpoint, fast_item(0)).unwrap();
    item.changes().recv_timeout(WAIT).unwrap();

    item.delete().unwrap();
    client.write(&live.setpoint, 50.0).unwrap();
    assert!(item.changes().recv_timeout(Duration::from_millis(300)).unwrap_err().is_transport());
}
