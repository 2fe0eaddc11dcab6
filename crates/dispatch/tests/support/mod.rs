use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatch::{
    orchestrator::SubmitRideRequest,
    test_support::{sample_driver, sample_passenger, test_epoch, MemoryDatabase},
    transport::{DriverEvent, PassengerEvent},
    DispatchConfig, Dispatcher,
};
use model::{
    driver::Driver,
    order::PaymentKind,
    passenger::Passenger,
    GeoPoint, Place,
};
use tokio::sync::mpsc;
use utility::{
    clock::{Clock, ManualClock},
    id::Id,
};

/// Pickup used by most scenarios.
pub const PICKUP: GeoPoint = GeoPoint {
    latitude: 23.993,
    longitude: 121.601,
};

/// Destination a short hop south-east of the pickup.
pub const DESTINATION: GeoPoint = GeoPoint {
    latitude: 23.987,
    longitude: 121.606,
};

pub struct Harness {
    pub dispatcher: Arc<Dispatcher<MemoryDatabase>>,
    pub database: MemoryDatabase,
    pub clock: Arc<ManualClock>,
}

pub fn t0() -> DateTime<Utc> {
    test_epoch()
}

pub async fn harness() -> Harness {
    harness_with(DispatchConfig::default()).await
}

pub async fn harness_with(config: DispatchConfig) -> Harness {
    let database = MemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(test_epoch()));
    let dispatcher =
        Dispatcher::new(database.clone(), clock.clone(), config, None);
    Harness {
        dispatcher,
        database,
        clock,
    }
}

impl Harness {
    /// Seeds a driver, opens their push session and puts them AVAILABLE at
    /// `point`.
    pub async fn connect_driver(
        &self,
        id: &str,
        point: GeoPoint,
        rating: f64,
    ) -> (Id<Driver>, mpsc::Receiver<DriverEvent>) {
        let driver = sample_driver(id, rating);
        let driver_id = driver.id.clone();
        self.database.seed_driver(driver).await;
        let (_connection, rx) =
            self.dispatcher.drivers.register(driver_id.clone()).await;
        let now = self.clock.now();
        self.dispatcher
            .presence
            .set_online(driver_id.clone(), now)
            .await;
        self.dispatcher
            .presence
            .update_location(driver_id.clone(), point, None, None, now)
            .await;
        (driver_id, rx)
    }

    pub async fn connect_passenger(
        &self,
        id: &str,
    ) -> (Id<Passenger>, mpsc::Receiver<PassengerEvent>) {
        let passenger = sample_passenger(id);
        let passenger_id = passenger.id.clone();
        self.database.seed_passenger(passenger).await;
        let (_connection, rx) = self
            .dispatcher
            .passengers
            .register(passenger_id.clone())
            .await;
        (passenger_id, rx)
    }

    pub fn ride_from(
        &self,
        passenger_id: &Id<Passenger>,
        pickup: GeoPoint,
    ) -> SubmitRideRequest {
        SubmitRideRequest {
            passenger_id: Some(passenger_id.clone()),
            passenger_name: None,
            passenger_phone: "+886911000".to_owned(),
            pickup: Place::new(pickup, Some("pickup".to_owned())),
            destination: Some(Place::new(
                DESTINATION,
                Some("destination".to_owned()),
            )),
            payment: PaymentKind::Cash,
        }
    }
}

/// Moves north by roughly `meters` along the latitude axis.
pub fn north_of(point: GeoPoint, meters: f64) -> GeoPoint {
    GeoPoint::new(point.latitude + meters / 111_190.0, point.longitude)
}

pub fn drain_driver(rx: &mut mpsc::Receiver<DriverEvent>) -> Vec<DriverEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn drain_passenger(
    rx: &mut mpsc::Receiver<PassengerEvent>,
) -> Vec<PassengerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
