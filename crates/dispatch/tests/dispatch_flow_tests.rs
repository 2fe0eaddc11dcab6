mod support;

use chrono::Duration;
use dispatch::{
    orchestrator::{AcceptOutcome, SubmitOutcome},
    transport::{DriverEvent, PassengerEvent},
    DispatchError,
};
use model::{
    order::{Actor, OrderStatus, Settlement},
    rejection::RejectionReason,
};
use support::*;
use utility::clock::Clock;

fn offered_ids(outcome: &SubmitOutcome) -> Vec<String> {
    match outcome {
        SubmitOutcome::Dispatched { offered_to, .. } => {
            offered_to.iter().map(|id| id.raw()).collect()
        }
        SubmitOutcome::Queued { .. } => panic!("expected a dispatched ride"),
    }
}

fn order_id(outcome: &SubmitOutcome) -> model::order::Order {
    match outcome {
        SubmitOutcome::Dispatched { order, .. } => order.clone(),
        SubmitOutcome::Queued { order, .. } => order.clone(),
    }
}

#[tokio::test]
async fn happy_path_wave_one_acceptance() {
    let harness = harness().await;
    let (d1, mut rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (_d2, mut rx2) = harness.connect_driver("d2", north_of(PICKUP, 600.0), 4.5).await;
    let (_d3, mut rx3) = harness.connect_driver("d3", north_of(PICKUP, 1_200.0), 4.5).await;
    let (p1, mut prx) = harness.connect_passenger("p1").await;

    let outcome = harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await
        .unwrap();

    // Wave 1 goes out closest-first.
    assert_eq!(offered_ids(&outcome), vec!["d1", "d2", "d3"]);
    let order = order_id(&outcome);
    assert_eq!(order.status, OrderStatus::Offered);
    assert_eq!(order.batch_number, 1);

    for rx in [&mut rx1, &mut rx2, &mut rx3] {
        let events = drain_driver(rx);
        assert!(matches!(
            events.as_slice(),
            [DriverEvent::OrderOffer { wave_number: 1, .. }]
        ));
    }

    harness.clock.advance(Duration::seconds(4));
    let accepted = harness
        .dispatcher
        .accept_offer(&order.id, &d1)
        .await
        .unwrap();
    assert_eq!(accepted, AcceptOutcome::Accepted);

    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Accepted);
    assert_eq!(stored.driver_id.as_ref().map(|id| id.raw()), Some("d1".to_owned()));

    // Exactly one wave row carries the acceptance, with the race timing.
    let logs = harness.database.dispatch_logs().await;
    let accepted_rows: Vec<_> =
        logs.iter().filter(|log| log.acceptance.is_some()).collect();
    assert_eq!(accepted_rows.len(), 1);
    let acceptance = accepted_rows[0].acceptance.as_ref().unwrap();
    assert_eq!(acceptance.driver_id.raw(), "d1");
    assert_eq!(acceptance.response_ms, 4_000);

    // Losers see their offer voided.
    for rx in [&mut rx2, &mut rx3] {
        let events = drain_driver(rx);
        assert!(events.iter().any(|event| matches!(
            event,
            DriverEvent::OrderCancelled { reason, .. } if reason == "taken"
        )));
    }

    // The winner keeps the offer, no cancellation.
    assert!(drain_driver(&mut rx1).is_empty());

    let passenger_events = drain_passenger(&mut prx);
    assert!(passenger_events.iter().any(|event| matches!(
        event,
        PassengerEvent::OrderUpdate { order } if order.status == OrderStatus::Accepted
    )));

    // Driver presence is serialized with the acceptance.
    let presence = harness.dispatcher.presence.get(&d1).await.unwrap();
    assert_eq!(presence.current_order.as_ref().map(|id| id.raw()), Some(order.id.raw()));
}

#[tokio::test]
async fn winning_accept_is_idempotent_and_losers_get_taken() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (d2, _rx2) = harness.connect_driver("d2", north_of(PICKUP, 600.0), 4.5).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );

    assert_eq!(
        harness.dispatcher.accept_offer(&order.id, &d1).await.unwrap(),
        AcceptOutcome::Accepted
    );
    assert_eq!(
        harness.dispatcher.accept_offer(&order.id, &d1).await.unwrap(),
        AcceptOutcome::AlreadyAcceptedByYou
    );
    assert!(matches!(
        harness.dispatcher.accept_offer(&order.id, &d2).await,
        Err(DispatchError::AlreadyTaken)
    ));

    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.driver_id.map(|id| id.raw()), Some("d1".to_owned()));
}

#[tokio::test]
async fn simultaneous_accepts_produce_exactly_one_winner() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (d2, mut rx2) = harness.connect_driver("d2", north_of(PICKUP, 400.0), 4.7).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );

    let (first, second) = tokio::join!(
        harness.dispatcher.accept_offer(&order.id, &d1),
        harness.dispatcher.accept_offer(&order.id, &d2),
    );

    let winners = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Ok(AcceptOutcome::Accepted)))
        .count();
    let losers = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Err(DispatchError::AlreadyTaken)))
        .count();
    assert_eq!((winners, losers), (1, 1));

    let stored = harness.database.order(&order.id).await.unwrap();
    assert!(stored.driver_id.is_some());

    // If d2 lost, its connection saw the offer voided.
    if matches!(second, Err(DispatchError::AlreadyTaken)) {
        let events = drain_driver(&mut rx2);
        assert!(events.iter().any(|event| matches!(
            event,
            DriverEvent::OrderCancelled { reason, .. } if reason == "taken"
        )));
    }
}

#[tokio::test]
async fn accept_at_exactly_the_deadline_is_stale() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );

    // The deadline itself already ends the wave; >= wins over >.
    harness.clock.advance(Duration::seconds(20));
    assert!(matches!(
        harness.dispatcher.accept_offer(&order.id, &d1).await,
        Err(DispatchError::Stale)
    ));

    harness.clock.advance(Duration::milliseconds(1));
    assert!(matches!(
        harness.dispatcher.accept_offer(&order.id, &d1).await,
        Err(DispatchError::Stale)
    ));
}

#[tokio::test(start_paused = true)]
async fn wave_escalation_after_rejections_and_timeout() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (_d2, _rx2) = harness.connect_driver("d2", north_of(PICKUP, 600.0), 4.6).await;
    let (d3, _rx3) = harness.connect_driver("d3", north_of(PICKUP, 1_200.0), 4.4).await;
    // Outside wave 1's 5 km ring, inside wave 2's 10 km ring.
    let (d4, mut rx4) = harness.connect_driver("d4", north_of(PICKUP, 6_000.0), 4.2).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let outcome = harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await
        .unwrap();
    let order = order_id(&outcome);
    assert_eq!(offered_ids(&outcome), vec!["d1", "d2", "d3"]);
    assert!(drain_driver(&mut rx4).is_empty());

    harness.clock.advance(Duration::seconds(2));
    harness
        .dispatcher
        .reject_offer(&order.id, &d1, RejectionReason::Busy)
        .await
        .unwrap();
    harness.clock.advance(Duration::seconds(1));
    harness
        .dispatcher
        .reject_offer(&order.id, &d3, RejectionReason::TooFar)
        .await
        .unwrap();

    // d2 never answers; the 20 s deadline ends the wave.
    harness.clock.advance(Duration::seconds(17));
    tokio::time::sleep(std::time::Duration::from_secs(21)).await;

    let events = drain_driver(&mut rx4);
    assert!(
        matches!(
            events.as_slice(),
            [DriverEvent::OrderOffer { wave_number: 2, .. }]
        ),
        "expected wave 2 offer for d4, got {:?}",
        events
    );

    let rejections = harness.database.rejections().await;
    let mut by_driver: Vec<(String, RejectionReason)> = rejections
        .iter()
        .map(|record| (record.driver_id.raw(), record.reason))
        .collect();
    by_driver.sort();
    assert_eq!(
        by_driver,
        vec![
            ("d1".to_owned(), RejectionReason::Busy),
            ("d2".to_owned(), RejectionReason::Timeout),
            ("d3".to_owned(), RejectionReason::TooFar),
        ]
    );

    // Nobody from wave 1 reappears in wave 2.
    let logs = harness.database.dispatch_logs().await;
    let wave2 = logs.iter().find(|log| log.wave_number == 2).unwrap();
    let wave2_ids: Vec<String> =
        wave2.candidates.iter().map(|c| c.driver_id.raw()).collect();
    assert_eq!(wave2_ids, vec!["d4"]);

    let accepted = harness
        .dispatcher
        .accept_offer(&order.id, &d4)
        .await
        .unwrap();
    assert_eq!(accepted, AcceptOutcome::Accepted);
}

#[tokio::test(start_paused = true)]
async fn churned_driver_counts_as_timeout_and_stays_excluded() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (d2, _rx2) = harness.connect_driver("d2", north_of(PICKUP, 600.0), 4.6).await;
    let (d3, _rx3) = harness.connect_driver("d3", north_of(PICKUP, 1_200.0), 4.4).await;
    let (d4, mut rx4) = harness.connect_driver("d4", north_of(PICKUP, 6_000.0), 4.2).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );

    // d1's session dies before answering.
    harness.dispatcher.driver_disconnected(&d1).await;
    let rejections = harness.database.rejections().await;
    assert!(rejections
        .iter()
        .any(|r| r.driver_id.raw() == "d1" && r.reason == RejectionReason::Timeout));

    // Reconnecting within the wave window does not revive the offer.
    let (_connection, _new_rx) = harness.dispatcher.drivers.register(d1.clone()).await;
    harness
        .dispatcher
        .presence
        .set_online(d1.clone(), harness.clock.now())
        .await;
    assert!(matches!(
        harness.dispatcher.accept_offer(&order.id, &d1).await,
        Err(DispatchError::Stale)
    ));

    harness
        .dispatcher
        .reject_offer(&order.id, &d2, RejectionReason::Busy)
        .await
        .unwrap();
    harness
        .dispatcher
        .reject_offer(&order.id, &d3, RejectionReason::Busy)
        .await
        .unwrap();
    // All of wave 1 responded; escalation runs without waiting the timer.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let logs = harness.database.dispatch_logs().await;
    let wave2 = logs.iter().find(|log| log.wave_number == 2).unwrap();
    let wave2_ids: Vec<String> =
        wave2.candidates.iter().map(|c| c.driver_id.raw()).collect();
    assert_eq!(wave2_ids, vec!["d4"]);
    assert!(matches!(
        drain_driver(&mut rx4).as_slice(),
        [DriverEvent::OrderOffer { wave_number: 2, .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn exhausted_candidates_cancel_with_no_driver() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, mut prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );
    drain_passenger(&mut prx);

    harness
        .dispatcher
        .reject_offer(&order.id, &d1, RejectionReason::OffDuty)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(stored.cancel_reason.as_deref(), Some("no_driver"));
    assert_eq!(stored.cancelled_by, Some(Actor::System));

    let events = drain_passenger(&mut prx);
    assert!(events.iter().any(|event| matches!(
        event,
        PassengerEvent::NoDriver { order_id } if order_id.raw() == order.id.raw()
    )));
}

#[tokio::test]
async fn full_trip_reaches_done_and_updates_stats() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );
    harness.dispatcher.accept_offer(&order.id, &d1).await.unwrap();

    harness
        .dispatcher
        .advance_trip(&order.id, &d1, OrderStatus::Arrived, None)
        .await
        .unwrap();
    harness
        .dispatcher
        .advance_trip(&order.id, &d1, OrderStatus::OnTrip, None)
        .await
        .unwrap();
    harness
        .dispatcher
        .advance_trip(
            &order.id,
            &d1,
            OrderStatus::Settling,
            Some(Settlement {
                meter_amount: 230.0,
                distance_m: 1_900.0,
                duration_s: 420.0,
                photo_url: None,
            }),
        )
        .await
        .unwrap();
    let done = harness
        .dispatcher
        .advance_trip(&order.id, &d1, OrderStatus::Done, None)
        .await
        .unwrap();

    assert_eq!(done.status, OrderStatus::Done);
    assert_eq!(done.meter_amount, Some(230.0));
    assert!(done.completed_at.is_some());

    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Done);

    // Driver went back to the pool and their counters moved.
    let presence = harness.dispatcher.presence.get(&d1).await.unwrap();
    assert!(presence.current_order.is_none());
    let driver = harness.database.driver(&d1).await.unwrap();
    assert_eq!(driver.total_trips, 101);
    assert_eq!(driver.total_earnings, 10_230.0);
}

#[tokio::test]
async fn trip_phase_skips_are_bad_transitions() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );
    harness.dispatcher.accept_offer(&order.id, &d1).await.unwrap();

    assert!(matches!(
        harness
            .dispatcher
            .advance_trip(&order.id, &d1, OrderStatus::Settling, None)
            .await,
        Err(DispatchError::BadTransition { .. })
    ));
    // Failed attempt left the order untouched.
    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Accepted);
}

#[tokio::test]
async fn only_the_assignee_advances() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (d2, _rx2) = harness.connect_driver("d2", north_of(PICKUP, 600.0), 4.5).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );
    harness.dispatcher.accept_offer(&order.id, &d1).await.unwrap();

    assert!(matches!(
        harness
            .dispatcher
            .advance_trip(&order.id, &d2, OrderStatus::Arrived, None)
            .await,
        Err(DispatchError::NotAssignee)
    ));
}

#[tokio::test]
async fn passenger_cancel_frees_driver_and_notifies() {
    let harness = harness().await;
    let (d1, mut rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );
    harness.dispatcher.accept_offer(&order.id, &d1).await.unwrap();
    drain_driver(&mut rx1);

    harness
        .dispatcher
        .cancel_order(&order.id, Actor::Passenger, Some("p1"), "changed my mind")
        .await
        .unwrap();

    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(stored.cancelled_by, Some(Actor::Passenger));

    let events = drain_driver(&mut rx1);
    assert!(events.iter().any(|event| matches!(
        event,
        DriverEvent::OrderCancelled { .. }
    )));

    let presence = harness.dispatcher.presence.get(&d1).await.unwrap();
    assert!(presence.current_order.is_none());
    assert_eq!(
        presence.availability,
        model::driver::Availability::Available
    );
}

#[tokio::test]
async fn cancel_after_trip_start_is_refused() {
    let harness = harness().await;
    let (d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );
    harness.dispatcher.accept_offer(&order.id, &d1).await.unwrap();
    harness
        .dispatcher
        .advance_trip(&order.id, &d1, OrderStatus::Arrived, None)
        .await
        .unwrap();
    harness
        .dispatcher
        .advance_trip(&order.id, &d1, OrderStatus::OnTrip, None)
        .await
        .unwrap();

    assert!(matches!(
        harness
            .dispatcher
            .cancel_order(&order.id, Actor::Passenger, Some("p1"), "too late")
            .await,
        Err(DispatchError::BadTransition { .. })
    ));
}

#[tokio::test]
async fn blocked_passenger_cannot_submit() {
    let harness = harness().await;
    let (_d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let mut passenger = dispatch::test_support::sample_passenger("p1");
    passenger.is_blocked = true;
    let passenger_id = passenger.id.clone();
    harness.database.seed_passenger(passenger).await;

    assert!(matches!(
        harness
            .dispatcher
            .submit_ride(harness.ride_from(&passenger_id, PICKUP))
            .await,
        Err(DispatchError::PassengerBlocked)
    ));
    assert!(harness.database.orders().await.is_empty());
}

#[tokio::test]
async fn stale_heartbeat_driver_is_dropped_before_offers() {
    let harness = harness().await;
    let (_d1, mut rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (d2, mut rx2) = harness.connect_driver("d2", north_of(PICKUP, 600.0), 4.5).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    // d1 goes quiet for longer than the freshness window; d2 keeps ticking.
    harness.clock.advance(Duration::minutes(6));
    harness
        .dispatcher
        .presence
        .update_location(
            d2.clone(),
            north_of(PICKUP, 600.0),
            None,
            None,
            harness.clock.now(),
        )
        .await;

    let outcome = harness
        .dispatcher
        .submit_ride(harness.ride_from(&p1, PICKUP))
        .await
        .unwrap();
    assert_eq!(offered_ids(&outcome), vec!["d2"]);
    assert!(drain_driver(&mut rx1).is_empty());
    assert!(!drain_driver(&mut rx2).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_terminal_write_is_flushed_by_the_sweeper() {
    let harness = harness().await;
    let (_d1, _rx1) = harness.connect_driver("d1", north_of(PICKUP, 300.0), 4.8).await;
    let (p1, _prx) = harness.connect_passenger("p1").await;

    let order = order_id(
        &harness
            .dispatcher
            .submit_ride(harness.ride_from(&p1, PICKUP))
            .await
            .unwrap(),
    );

    // Storage refuses the terminal write long enough to park it dirty.
    harness.database.fail_order_writes(3).await;
    harness
        .dispatcher
        .cancel_order(&order.id, Actor::Passenger, Some("p1"), "whatever")
        .await
        .unwrap();
    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Offered);

    // Next sweep retries and wins.
    harness.dispatcher.sweep().await;
    let stored = harness.database.order(&order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
}
