//! Publish-cycle behavior driven through a server on virtual time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uasub::node_id::well_known;
use uasub::subscription::{
    CloseReason, DiscardPolicy, MonitoringMode, MonitoringParameters, NotificationBody, NotificationMessage,
    SubscriptionParameters, SubscriptionState,
};
use uasub::{
    DataType, InMemoryAddressSpace, ManualClock, NodeId, Server, ServerConfig, Session, UserIdentity, Variable,
    Variant,
};

struct Fixture {
    server: Server,
    clock: Arc<ManualClock>,
    session: Arc<Session>,
    ticker: NodeId,
    constant: NodeId,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    fn with_config(config: ServerConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let space = Arc::new(InMemoryAddressSpace::new());

        let ticker = NodeId::string(1, "ticker");
        let counter = Arc::new(AtomicU32::new(0));
        space
            .add_variable(
                &well_known::OBJECTS_FOLDER,
                Variable::builder(ticker.clone(), "Ticker", DataType::UInt32)
                    .getter(move || Ok(Variant::UInt32(counter.fetch_add(1, Ordering::Relaxed))))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let constant = NodeId::string(1, "constant");
        space
            .add_variable(
                &well_known::OBJECTS_FOLDER,
                Variable::builder(constant.clone(), "Constant", DataType::Double)
                    .constant(Variant::Double(42.0))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let server = Server::new(config, space, clock.clone()).unwrap();
        let session = server.create_session(&UserIdentity::Anonymous).unwrap();
        Self {
            server,
            clock,
            session,
            ticker,
            constant,
        }
    }

    fn advance_ms(&self, ms: u64) {
        self.server.advance(&self.clock, Duration::from_millis(ms)).unwrap();
    }
}

fn params(interval_ms: u64, lifetime: u32, keep_alive: u32) -> SubscriptionParameters {
    SubscriptionParameters {
        publishing_interval: Duration::from_millis(interval_ms),
        lifetime_count: lifetime,
        max_keep_alive_count: keep_alive,
        max_notifications_per_publish: 0,
        publishing_enabled: true,
        priority: 0,
    }
}

fn data_changes(message: &NotificationMessage) -> Vec<(u32, bool)> {
    match &message.body {
        NotificationBody::DataChange(items) => items.iter().map(|n| (n.client_handle, n.overflow)).collect(),
        other => panic!("expected data change, got {other:?}"),
    }
}

#[test]
fn test_keep_alive_on_tenth_empty_cycle() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(1000, 100, 10)).unwrap();
    let request = fx.session.publish(sub.id).unwrap();

    fx.advance_ms(9_999);
    assert!(request.try_take().is_none());

    fx.advance_ms(1);
    let response = request.try_take().expect("keep-alive at 10s");
    assert!(response.message.is_keep_alive());
    assert_eq!(response.message.sequence_number, 1);

    // A second request stays unanswered for the rest of the 15s window.
    let second = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(5_000);
    assert!(second.try_take().is_none());
    assert_eq!(fx.session.subscription_state(sub.id).unwrap(), SubscriptionState::Normal);
}

#[test]
fn test_keep_alive_does_not_consume_sequence_number() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(1000, 10, 3)).unwrap();

    let first = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(3_000);
    let keep_alive = first.try_take().unwrap();
    assert!(keep_alive.message.is_keep_alive());
    assert_eq!(keep_alive.message.sequence_number, 1);

    fx.session
        .create_monitored_item(sub.id, &fx.constant, &MonitoringParameters::new(5))
        .unwrap();
    let second = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(1_000);
    let data = second.try_take().unwrap();
    assert_eq!(data_changes(&data.message), vec![(5, false)]);
    assert_eq!(data.message.sequence_number, 1);

    let third = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(3_000);
    let keep_alive = third.try_take().unwrap();
    assert!(keep_alive.message.is_keep_alive());
    assert_eq!(keep_alive.message.sequence_number, 2);
}

#[test]
fn test_unanswered_keep_alive_makes_subscription_late() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(1000, 5, 1)).unwrap();

    fx.advance_ms(1_000);
    assert_eq!(fx.session.subscription_state(sub.id).unwrap(), SubscriptionState::Late);

    let request = fx.session.publish(sub.id).unwrap();
    let held = request.try_take().expect("held keep-alive released immediately");
    assert!(held.message.is_keep_alive());
    assert_eq!(fx.session.subscription_state(sub.id).unwrap(), SubscriptionState::Normal);
}

#[test]
fn test_lifetime_expiry_leaves_tombstone_for_next_publish() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(100, 3, 1)).unwrap();

    fx.advance_ms(200);
    assert_eq!(fx.session.subscription_state(sub.id).unwrap(), SubscriptionState::Late);

    fx.advance_ms(100);
    assert!(fx.session.subscription(sub.id).unwrap_err().is_not_found());

    let request = fx.session.publish(sub.id).unwrap();
    let response = request.try_take().expect("status change delivered immediately");
    assert_eq!(response.message.status_change(), Some(CloseReason::Expired));
    assert_eq!(response.message.sequence_number, 1);

    assert!(fx.session.publish(sub.id).unwrap_err().is_not_found());
}

#[test]
fn test_lifetime_expiry_answers_outstanding_request() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(100, 3, 2)).unwrap();

    let first = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(200);
    assert!(first.try_take().unwrap().message.is_keep_alive());

    let last = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(100);
    let response = last.try_take().expect("expiry reported to the waiting request");
    assert_eq!(response.message.status_change(), Some(CloseReason::Expired));
    assert_eq!(response.message.sequence_number, 1);
    assert!(fx.session.publish(sub.id).unwrap_err().is_not_found());
}

#[test]
fn test_disabled_publishing_freezes_counters() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(100, 3, 1)).unwrap();
    fx.session.set_publishing_mode(sub.id, false).unwrap();
    let item = fx
        .session
        .create_monitored_item(sub.id, &fx.constant, &MonitoringParameters::new(1))
        .unwrap();

    let request = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(1_000);
    assert!(request.try_take().is_none());
    let subscription = fx.session.subscription(sub.id).unwrap();
    assert_eq!(subscription.counters().unwrap(), (3, 1));
    assert!(!subscription.state().unwrap().is_closed());
    assert_eq!(fx.session.monitored_item(sub.id, item.id).unwrap().queue_len().unwrap(), 1);

    fx.session.set_publishing_mode(sub.id, true).unwrap();
    fx.advance_ms(100);
    let response = request.try_take().expect("data once publishing resumes");
    assert_eq!(data_changes(&response.message), vec![(1, false)]);
}

#[test]
fn test_discard_oldest_keeps_newest_and_marks_front() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(2000, 100, 10)).unwrap();
    let item = fx
        .session
        .create_monitored_item(
            sub.id,
            &fx.ticker,
            &MonitoringParameters::new(9)
                .with_sampling_interval(Duration::from_millis(100))
                .with_queue_size(10)
                .with_discard_policy(DiscardPolicy::DiscardOldest),
        )
        .unwrap();

    fx.advance_ms(1_950);
    let monitored = fx.session.monitored_item(sub.id, item.id).unwrap();
    assert_eq!(monitored.sample_count().unwrap(), 20);
    assert_eq!(monitored.queue_len().unwrap(), 10);
    assert_eq!(monitored.overflow_count().unwrap(), 10);

    let request = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(50);
    let response = request.try_take().unwrap();
    let NotificationBody::DataChange(items) = &response.message.body else {
        panic!("expected data change");
    };
    assert_eq!(items.len(), 10);
    assert!(items[0].overflow);
    assert!(items[1..].iter().all(|n| !n.overflow));

    let values: Vec<u32> = items
        .iter()
        .map(|n| match n.value.value {
            Variant::UInt32(v) => v,
            ref other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert!(values.windows(2).all(|w| w[0] < w[1]));
    assert!(values[0] >= 10);
}

#[test]
fn test_sample_count_tracks_window_over_interval() {
    for interval_ms in [10_u64, 33, 100, 250] {
        for window_ms in [1_000_u64, 1_950, 2_050] {
            let fx = Fixture::new();
            let sub = fx.session.create_subscription(&params(10_000, 100, 10)).unwrap();
            let item = fx
                .session
                .create_monitored_item(
                    sub.id,
                    &fx.ticker,
                    &MonitoringParameters::new(1)
                        .with_sampling_interval(Duration::from_millis(interval_ms))
                        .with_queue_size(1_000),
                )
                .unwrap();

            fx.advance_ms(window_ms);
            let taken = fx
                .session
                .monitored_item(sub.id, item.id)
                .unwrap()
                .sample_count()
                .unwrap();
            let expected = window_ms / interval_ms;
            assert!(
                taken.abs_diff(expected) <= 1,
                "t={interval_ms}ms W={window_ms}ms: {taken} samples, expected {expected} +/- 1"
            );
        }
    }
}

#[test]
fn test_discard_newest_marks_first_value_after_gap() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(1000, 100, 10)).unwrap();
    let item = fx
        .session
        .create_monitored_item(
            sub.id,
            &fx.ticker,
            &MonitoringParameters::new(2)
                .with_sampling_interval(Duration::from_millis(100))
                .with_queue_size(3)
                .with_discard_policy(DiscardPolicy::DiscardNewest),
        )
        .unwrap();

    fx.advance_ms(950);
    let monitored = fx.session.monitored_item(sub.id, item.id).unwrap();
    assert_eq!(monitored.queue_len().unwrap(), 3);
    assert_eq!(monitored.overflow_count().unwrap(), 7);

    let first = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(50);
    assert_eq!(data_changes(&first.try_take().unwrap().message), vec![(2, false); 3]);

    let second = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(1_000);
    let flags = data_changes(&second.try_take().unwrap().message);
    assert_eq!(flags.len(), 3);
    assert_eq!(flags[0], (2, true));
    assert!(flags[1..].iter().all(|&(_, overflow)| !overflow));
}

#[test]
fn test_batch_cap_sets_more_notifications() {
    let fx = Fixture::new();
    let mut requested = params(1000, 100, 10);
    requested.max_notifications_per_publish = 5;
    let sub = fx.session.create_subscription(&requested).unwrap();
    fx.session
        .create_monitored_item(
            sub.id,
            &fx.ticker,
            &MonitoringParameters::new(4)
                .with_sampling_interval(Duration::from_millis(100))
                .with_queue_size(10),
        )
        .unwrap();

    let request = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(1_000);
    let response = request.try_take().unwrap();
    assert_eq!(response.message.data_changes().len(), 5);
    assert!(response.more_notifications);
}

#[test]
fn test_sampling_mode_queues_without_reporting() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(1000, 100, 10)).unwrap();
    let item = fx
        .session
        .create_monitored_item(
            sub.id,
            &fx.constant,
            &MonitoringParameters::new(3).with_monitoring_mode(MonitoringMode::Sampling),
        )
        .unwrap();

    let request = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(1_000);
    assert!(request.try_take().is_none());

    fx.session
        .set_monitoring_mode(sub.id, item.id, MonitoringMode::Reporting)
        .unwrap();
    fx.advance_ms(1_000);
    assert_eq!(data_changes(&request.try_take().unwrap().message), vec![(3, false)]);
}

#[test]
fn test_publish_timeout_answers_with_keep_alive() {
    let config = ServerConfig {
        publish_timeout_ms: 500,
        ..ServerConfig::default()
    };
    let fx = Fixture::with_config(config);
    let sub = fx.session.create_subscription(&params(1000, 100, 10)).unwrap();

    let request = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(500);
    let response = request.try_take().expect("timed-out request answered");
    assert!(response.message.is_keep_alive());
    assert_eq!(fx.session.outstanding_publish_requests(sub.id).unwrap(), 0);
    assert_eq!(fx.session.subscription(sub.id).unwrap().counters().unwrap(), (100, 10));
}

#[test]
fn test_modify_subscription_restarts_counters() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(1000, 100, 10)).unwrap();
    fx.advance_ms(3_000);
    assert_eq!(fx.session.subscription(sub.id).unwrap().counters().unwrap(), (97, 7));

    let revised = fx.session.modify_subscription(sub.id, &params(10, 20, 4)).unwrap();
    assert_eq!(revised.publishing_interval, Duration::from_millis(50));
    assert_eq!(fx.session.subscription(sub.id).unwrap().counters().unwrap(), (20, 4));

    let request = fx.session.publish(sub.id).unwrap();
    fx.advance_ms(200);
    assert!(request.try_take().unwrap().message.is_keep_alive());
}

#[test]
fn test_delete_subscription_reports_status_change() {
    let fx = Fixture::new();
    let sub = fx.session.create_subscription(&params(1000, 100, 10)).unwrap();
    let request = fx.session.publish(sub.id).unwrap();

    fx.session.delete_subscription(sub.id).unwrap();
    let response = request.try_take().unwrap();
    assert_eq!(response.message.status_change(), Some(CloseReason::Deleted));
    assert!(fx.session.delete_subscription(sub.id).unwrap_err().is_not_found());

    // Timers for the deleted subscription are gone.
    fx.advance_ms(5_000);
    assert_eq!(fx.server.next_due().unwrap(), None);
}
