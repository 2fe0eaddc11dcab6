mod support;

use chrono::Duration;
use dispatch::{
    orchestrator::SubmitOutcome,
    test_support::sample_zone,
    transport::{DriverEvent, PassengerEvent},
    zones::Admission,
    DispatchConfig, DispatchError, Dispatcher,
};
use model::order::{Actor, DispatchMethod, OrderStatus};
use support::*;
use utility::clock::Clock;

#[tokio::test]
async fn zone_full_without_queue_creates_nothing() {
    let harness = harness().await;
    let mut zone = sample_zone("zone_east", "EastMarket", PICKUP, 800.0);
    zone.peak_hours = vec![10];
    zone.quota_peak = 3;
    zone.queue_enabled = false;
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let (_d1, mut rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    // Three earlier rides this hour ate the whole peak quota.
    let now = harness.clock.now();
    for _ in 0..3 {
        assert!(matches!(
            harness.dispatcher.zones.reserve(&PICKUP, now).await,
            Admission::Admitted { .. }
        ));
    }

    let result = harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await;
    assert!(matches!(
        result,
        Err(DispatchError::ZoneFull { zone }) if zone == "EastMarket"
    ));

    // No order row, no candidate ever polled.
    assert!(harness.database.orders().await.is_empty());
    assert!(drain_driver(&mut rx1).is_empty());
}

#[tokio::test]
async fn filling_zone_raises_surge_on_the_quote() {
    let harness = harness().await;
    let zone = sample_zone("zone_station", "Station", PICKUP, 800.0);
    // quota_normal 10, threshold 0.8, step 0.1, max 1.5 from the builder.
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let (_d1, mut rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let now = harness.clock.now();
    for _ in 0..9 {
        assert!(matches!(
            harness.dispatcher.zones.reserve(&PICKUP, now).await,
            Admission::Admitted { .. }
        ));
    }

    // The tenth admission sits at u = 0.9 and pays one surge step.
    let outcome = harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await
        .unwrap();
    let order = match &outcome {
        SubmitOutcome::Dispatched { order, .. } => order.clone(),
        SubmitOutcome::Queued { .. } => panic!("zone is not full yet"),
    };
    assert!((order.surge_multiplier - 1.1).abs() < 1e-9);

    let expected_fare = harness
        .dispatcher
        .config()
        .fare
        .estimate(PICKUP.distance_m(&DESTINATION), 1.1);
    assert!((order.estimated_fare - expected_fare).abs() < 1e-6);

    // The offer pushed to the driver carries the surged quote.
    let events = drain_driver(&mut rx1);
    match events.as_slice() {
        [DriverEvent::OrderOffer {
            surge_multiplier,
            estimated_fare,
            ..
        }] => {
            assert!((*surge_multiplier - 1.1).abs() < 1e-9);
            assert!((*estimated_fare - expected_fare).abs() < 1e-6);
        }
        other => panic!("expected one offer, got {:?}", other),
    }

    let stored = harness.database.order(&order.id).await.unwrap();
    assert!((stored.surge_multiplier - 1.1).abs() < 1e-9);
}

#[tokio::test]
async fn cancel_before_acceptance_restores_the_counter() {
    let harness = harness().await;
    let zone = sample_zone("zone_station", "Station", PICKUP, 800.0);
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let (_d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = match harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await
        .unwrap()
    {
        SubmitOutcome::Dispatched { order, .. } => order,
        SubmitOutcome::Queued { .. } => panic!("zone has capacity"),
    };

    let now = harness.clock.now();
    let status = harness.dispatcher.zones.check(&PICKUP, now).await.unwrap();
    assert_eq!(status.used, 1);

    harness
        .dispatcher
        .cancel_order(&order.id, Actor::Passenger, Some("p1"), "nvm")
        .await
        .unwrap();

    // reserve/release nets to zero.
    let status = harness.dispatcher.zones.check(&PICKUP, now).await.unwrap();
    assert_eq!(status.used, 0);
}

#[tokio::test]
async fn counter_used_never_exceeds_limit() {
    let harness = harness().await;
    let mut zone = sample_zone("zone_small", "Small", PICKUP, 800.0);
    zone.quota_normal = 2;
    zone.queue_enabled = false;
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let now = harness.clock.now();
    let mut admitted = 0;
    for _ in 0..5 {
        match harness.dispatcher.zones.reserve(&PICKUP, now).await {
            Admission::Admitted { .. } => admitted += 1,
            Admission::Full { .. } => {}
            other => panic!("unexpected admission {:?}", other),
        }
    }
    assert_eq!(admitted, 2);
    let status = harness.dispatcher.zones.check(&PICKUP, now).await.unwrap();
    assert!(status.used <= status.limit);
    assert_eq!(status.used, 2);
}

#[tokio::test(start_paused = true)]
async fn queued_ride_dispatches_once_capacity_frees() {
    let harness = harness().await;
    let mut zone = sample_zone("zone_q", "Harbor", PICKUP, 800.0);
    zone.quota_normal = 1;
    zone.queue_enabled = true;
    zone.max_queue_size = 5;
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let (_d1, mut rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _p1rx) = harness.connect_passenger("p1").await;
    let (p2, mut p2rx) = harness.connect_passenger("p2").await;

    let first = match harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await
        .unwrap()
    {
        SubmitOutcome::Dispatched { order, .. } => order,
        SubmitOutcome::Queued { .. } => panic!("first ride should dispatch"),
    };
    drain_driver(&mut rx1);

    let mut second_request = harness.ride_from(&p2, PICKUP);
    second_request.passenger_phone = "+886922000".to_owned();
    let (second, position) = match harness
        .dispatcher
        .submit_ride(second_request)
        .await
        .unwrap()
    {
        SubmitOutcome::Queued { order, position } => (order, position),
        SubmitOutcome::Dispatched { .. } => panic!("zone should be full"),
    };
    assert_eq!(position, 1);
    assert_eq!(second.dispatch_method, DispatchMethod::ZoneQueue);

    // Still parked while the ticket is held.
    harness.dispatcher.sweep().await;
    assert!(drain_driver(&mut rx1).is_empty());

    // Freeing the ticket lets the sweeper admit and dispatch the ride.
    harness
        .dispatcher
        .cancel_order(&first.id, Actor::Passenger, Some("p1"), "nvm")
        .await
        .unwrap();
    harness.dispatcher.sweep().await;

    let events = drain_driver(&mut rx1);
    assert!(
        events.iter().any(|event| matches!(
            event,
            DriverEvent::OrderOffer { order, .. } if order.id.raw() == second.id.raw()
        )),
        "queued ride should be offered, got {:?}",
        events
    );
    let updates = drain_passenger(&mut p2rx);
    assert!(updates
        .iter()
        .any(|event| matches!(event, PassengerEvent::OrderUpdate { .. })));
}

#[tokio::test(start_paused = true)]
async fn queued_ride_times_out_with_queue_timeout() {
    let harness = harness().await;
    let mut zone = sample_zone("zone_q", "Harbor", PICKUP, 800.0);
    zone.quota_normal = 1;
    zone.queue_enabled = true;
    zone.max_queue_size = 5;
    zone.queue_timeout_minutes = 10;
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let (_d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _p1rx) = harness.connect_passenger("p1").await;
    let (p2, mut p2rx) = harness.connect_passenger("p2").await;

    harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await
        .unwrap();
    let mut second_request = harness.ride_from(&p2, PICKUP);
    second_request.passenger_phone = "+886922000".to_owned();
    let second = match harness
        .dispatcher
        .submit_ride(second_request)
        .await
        .unwrap()
    {
        SubmitOutcome::Queued { order, .. } => order,
        SubmitOutcome::Dispatched { .. } => panic!("zone should be full"),
    };

    harness.clock.advance(Duration::minutes(10));
    harness.dispatcher.sweep().await;

    let stored = harness.database.order(&second.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(stored.cancel_reason.as_deref(), Some("QUEUE_TIMEOUT"));

    let events = drain_passenger(&mut p2rx);
    assert!(events.iter().any(|event| matches!(
        event,
        PassengerEvent::NoDriver { order_id } if order_id.raw() == second.id.raw()
    )));
}

#[tokio::test]
async fn overlapping_zones_resolve_by_priority() {
    let harness = harness().await;
    let mut low = sample_zone("zone_a", "Wide", PICKUP, 2_000.0);
    low.priority = 1;
    let mut high = sample_zone("zone_b", "Core", PICKUP, 500.0);
    high.priority = 5;
    harness.database.seed_zone(low).await;
    harness.database.seed_zone(high).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let now = harness.clock.now();
    match harness.dispatcher.zones.reserve(&PICKUP, now).await {
        Admission::Admitted { zone_name, .. } => assert_eq!(zone_name, "Core"),
        other => panic!("unexpected admission {:?}", other),
    }
}

#[tokio::test]
async fn surge_is_monotonic_within_the_hour() {
    let harness = harness().await;
    let mut zone = sample_zone("zone_m", "Station", PICKUP, 800.0);
    zone.quota_normal = 10;
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();
    let now = harness.clock.now();

    for _ in 0..9 {
        harness.dispatcher.zones.reserve(&PICKUP, now).await;
    }
    let peak = harness
        .dispatcher
        .zones
        .check(&PICKUP, now)
        .await
        .unwrap()
        .surge_multiplier;
    assert!((peak - 1.1).abs() < 1e-9);

    // A release drops utilization, but the quote may not fall this hour.
    harness.dispatcher.zones.release("Station", now).await;
    harness.dispatcher.zones.release("Station", now).await;
    let after = harness
        .dispatcher
        .zones
        .check(&PICKUP, now)
        .await
        .unwrap()
        .surge_multiplier;
    assert!(after >= peak);
}

#[tokio::test]
async fn restarted_engine_resumes_persisted_counters() {
    let harness = harness().await;
    let zone = sample_zone("zone_station", "Station", PICKUP, 800.0);
    harness.database.seed_zone(zone).await;
    harness.dispatcher.zones.reload().await.unwrap();

    let now = harness.clock.now();
    for _ in 0..9 {
        assert!(matches!(
            harness.dispatcher.zones.reserve(&PICKUP, now).await,
            Admission::Admitted { .. }
        ));
    }

    // A fresh process over the same storage picks the hour up where the
    // old one left it instead of starting from zero.
    let restarted = Dispatcher::new(
        harness.database.clone(),
        harness.clock.clone(),
        DispatchConfig::default(),
        None,
    );
    restarted.zones.reload().await.unwrap();

    let status = restarted.zones.check(&PICKUP, now).await.unwrap();
    assert_eq!(status.used, 9);
    assert!((status.surge_multiplier - 1.1).abs() < 1e-9);

    // The tenth ticket of the hour is still the last one.
    assert!(matches!(
        restarted.zones.reserve(&PICKUP, now).await,
        Admission::Admitted { .. }
    ));
    assert!(matches!(
        restarted.zones.reserve(&PICKUP, now).await,
        Admission::Full { .. }
    ));
}
