use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use delivery_tracker::{
    config::{SubscriberConfig, TrackingConfig},
    device::ChannelPositionSource,
    map::{MapConfig, MapInput, MapSurface, MarkerRole, Viewport},
    models::{Coordinates, DeliveryId, Fix},
    publisher::LocationPublisher,
    store::{memory::MemoryStore, LocationStore},
    subscriber::{ConnectionState, LocationSubscriber},
};

fn delivery(id: &str) -> DeliveryId {
    DeliveryId::try_from(id).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<ChannelPositionSource>,
    publisher: LocationPublisher,
    subscriber: LocationSubscriber,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(ChannelPositionSource::new());
    let subscriber_config = SubscriberConfig {
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
    };
    Harness {
        publisher: LocationPublisher::new(store.clone(), source.clone(), TrackingConfig::default()),
        subscriber: LocationSubscriber::new(store.clone(), subscriber_config),
        store,
        source,
    }
}

#[tokio::test]
async fn courier_fixes_reach_the_customer_map() {
    let h = harness();
    let id = delivery("order-1");

    let subscription = h.subscriber.activate(id.clone());
    let mut state = subscription.state();
    state.wait_for(|s| !s.is_loading).await.unwrap();
    assert!(!state.borrow().has_location());

    let handle = h.publisher.start_tracking(id.clone()).await.unwrap();
    assert!(h
        .source
        .push(&id, Fix::new(Utc::now(), -15.78, -47.93).with_speed(10.0)));

    let seen = state
        .wait_for(|s| s.has_location())
        .await
        .unwrap()
        .clone();
    let location = seen.location.unwrap();
    assert_eq!(location.latitude, -15.78);
    assert_eq!(location.longitude, -47.93);
    assert!((location.speed_kmh.unwrap() - 36.0).abs() < 1e-9);

    let customer = Coordinates::new(-15.79, -47.94).unwrap();
    let view = MapSurface::new(MapConfig::default()).unwrap().render(&MapInput {
        courier: Some(location.coordinates()),
        customer: Some(customer),
        ..Default::default()
    });
    let Viewport::Fit { bounds, padding_px } = view.viewport else {
        panic!("expected fitted bounds");
    };
    assert!(bounds.contains(&location.coordinates()));
    assert!(bounds.contains(&customer));
    assert_eq!(padding_px, [50, 50]);
    assert!(view.marker(MarkerRole::Courier).is_some());

    h.publisher.stop_tracking(handle).await;
    subscription.deactivate().await;
}

#[tokio::test]
async fn subscriber_is_seeded_with_the_stored_row() {
    let h = harness();
    let id = delivery("order-2");
    let fix = Fix::new(Utc::now(), 1.0, 2.0).with_heading(90.0);
    h.publisher.update_location(&id, &fix).await.unwrap();
    h.publisher.update_location(&id, &fix).await.unwrap();

    let subscription = h.subscriber.activate(id.clone());
    let mut state = subscription.state();
    let seeded = state
        .wait_for(|s| !s.is_loading)
        .await
        .unwrap()
        .clone();

    let stored = h.store.fetch_latest(&id).await.unwrap();
    assert_eq!(seeded.location, stored);
    assert_eq!(seeded.location.unwrap().version, 2);
    assert_eq!(h.store.row_count(&id).await, 1);
}

#[tokio::test]
async fn update_without_speed_clears_displayed_speed() {
    let h = harness();
    let id = delivery("order-3");
    h.publisher
        .update_location(&id, &Fix::new(Utc::now(), 1.0, 1.0).with_speed(5.0))
        .await
        .unwrap();

    let subscription = h.subscriber.activate(id.clone());
    let mut state = subscription.state();
    state
        .wait_for(|s| s.location.as_ref().is_some_and(|l| l.speed_kmh.is_some()))
        .await
        .unwrap();

    h.publisher
        .update_location(&id, &Fix::new(Utc::now(), 1.5, 1.5))
        .await
        .unwrap();
    let replaced = state
        .wait_for(|s| s.location.as_ref().is_some_and(|l| l.version == 2))
        .await
        .unwrap()
        .clone();
    assert_eq!(replaced.location.unwrap().speed_kmh, None);
}

#[tokio::test]
async fn no_updates_after_deactivation() {
    let h = harness();
    let id = delivery("order-4");

    let subscription = h.subscriber.activate(id.clone());
    let mut state = subscription.state();
    state.wait_for(|s| !s.is_loading).await.unwrap();
    assert_eq!(h.store.listener_count().await, 1);

    subscription.deactivate().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.store.listener_count().await, 0);

    h.publisher
        .update_location(&id, &Fix::new(Utc::now(), 3.0, 3.0))
        .await
        .unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(!state.borrow().has_location());
    assert_eq!(h.store.row_count(&id).await, 1);
}

#[tokio::test]
async fn subscriber_reconnects_after_feed_reset() {
    let h = harness();
    let id = delivery("order-5");

    let subscription = h.subscriber.activate(id.clone());
    let mut state = subscription.state();
    state.wait_for(|s| !s.is_loading).await.unwrap();

    h.store.reset_connections().await;
    state
        .wait_for(|s| s.connection == ConnectionState::Lost)
        .await
        .unwrap();

    // A write made while disconnected is picked up by the resync
    h.publisher
        .update_location(&id, &Fix::new(Utc::now(), 4.0, 4.0))
        .await
        .unwrap();
    let resynced = state
        .wait_for(|s| s.connection == ConnectionState::Live && s.has_location())
        .await
        .unwrap()
        .clone();
    assert_eq!(resynced.location.unwrap().latitude, 4.0);
    assert_eq!(resynced.error, None);
}

#[tokio::test]
async fn stopping_keeps_last_known_position() {
    let h = harness();
    let id = delivery("order-6");

    let handle = h.publisher.start_tracking(id.clone()).await.unwrap();
    h.source.push(&id, Fix::new(Utc::now(), 7.0, 7.0));
    while h.store.fetch_latest(&id).await.unwrap().is_none() {
        tokio::task::yield_now().await;
    }
    h.publisher.stop_tracking(handle).await;

    let subscription = h.subscriber.activate(id.clone());
    let mut state = subscription.state();
    let seeded = state
        .wait_for(|s| !s.is_loading)
        .await
        .unwrap()
        .clone();
    assert_eq!(seeded.location.unwrap().latitude, 7.0);
}
