use std::{error, result};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use model::{
    dispatch_log::{DispatchLog, WaveAcceptance},
    driver::{Availability, DayStats, Driver, DriverFix, OfferFilters},
    eta::{EtaEntry, EtaKey},
    order::{Order, OrderStatus},
    passenger::Passenger,
    pattern::DriverPattern,
    rating::Rating,
    rejection::RejectionRecord,
    zone::{HotZone, QuotaCounter},
};
use utility::id::Id;

#[derive(Debug)]
pub enum StorageError {
    NotFound,
    /// Optimistic-concurrency guard did not match.
    Conflict,
    Other(Box<dyn error::Error + Send + Sync>),
}

impl StorageError {
    pub fn other<E: error::Error + Send + Sync + 'static>(why: E) -> Self {
        Self::Other(Box::new(why))
    }
}

pub type Result<T> = result::Result<T, StorageError>;

/// Outcome of the guarded driver assignment backing the acceptance race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned,
    /// Someone else won, or the order left OFFERED first.
    Lost {
        status: OrderStatus,
        driver_id: Option<Id<Driver>>,
    },
}

#[async_trait]
pub trait DriverRepo {
    async fn get_driver(&mut self, id: &Id<Driver>) -> Result<Driver>;
    async fn all_drivers(&mut self) -> Result<Vec<Driver>>;
    /// Coalesced write-behind flush of presence data.
    async fn update_driver_presence(
        &mut self,
        id: &Id<Driver>,
        availability: Availability,
        fix: Option<DriverFix>,
        heartbeat: DateTime<Utc>,
    ) -> Result<()>;
    /// Lifetime counters bumped when a trip completes.
    async fn add_driver_trip(
        &mut self,
        id: &Id<Driver>,
        earnings: f64,
    ) -> Result<()>;
    async fn get_offer_filters(&mut self, id: &Id<Driver>)
        -> Result<OfferFilters>;
}

#[async_trait]
pub trait PassengerRepo {
    async fn get_passenger(&mut self, id: &Id<Passenger>) -> Result<Passenger>;
    async fn passenger_by_phone(
        &mut self,
        phone: &str,
    ) -> Result<Option<Passenger>>;
    async fn insert_passenger(&mut self, passenger: &Passenger) -> Result<()>;
    async fn add_passenger_trip(&mut self, id: &Id<Passenger>) -> Result<()>;
}

#[async_trait]
pub trait OrderRepo {
    async fn get_order(&mut self, id: &Id<Order>) -> Result<Order>;
    async fn insert_order(&mut self, order: &Order) -> Result<()>;
    /// Full-row update; the caller holds the per-order critical section, the
    /// status column still guards against lost updates from elsewhere.
    async fn update_order(
        &mut self,
        order: &Order,
        expected_status: OrderStatus,
    ) -> Result<()>;
    /// Compare-and-set of the acceptance race: assigns the driver iff the
    /// order is still OFFERED and unassigned.
    async fn try_assign_driver(
        &mut self,
        order_id: &Id<Order>,
        driver_id: &Id<Driver>,
        accepted_at: DateTime<Utc>,
    ) -> Result<AssignOutcome>;
    /// Ranged scan on (status, created_at), oldest first.
    async fn orders_in_status(
        &mut self,
        status: OrderStatus,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Order>>;
    async fn active_order_for_driver(
        &mut self,
        driver_id: &Id<Driver>,
    ) -> Result<Option<Order>>;
}

#[async_trait]
pub trait DispatchLogRepo {
    async fn append_dispatch_log(&mut self, log: &DispatchLog) -> Result<()>;
    async fn record_wave_acceptance(
        &mut self,
        order_id: &Id<Order>,
        wave_number: u32,
        acceptance: &WaveAcceptance,
    ) -> Result<()>;
}

#[async_trait]
pub trait RejectionRepo {
    async fn append_rejection(&mut self, record: &RejectionRecord) -> Result<()>;
}

#[async_trait]
pub trait RatingRepo {
    async fn append_rating(&mut self, rating: &Rating) -> Result<()>;
}

#[async_trait]
pub trait PatternRepo {
    async fn get_pattern(
        &mut self,
        driver_id: &Id<Driver>,
    ) -> Result<Option<DriverPattern>>;
    async fn put_pattern(&mut self, pattern: &DriverPattern) -> Result<()>;
}

#[async_trait]
pub trait EtaRepo {
    async fn get_eta(&mut self, key: &EtaKey) -> Result<Option<EtaEntry>>;
    async fn put_eta(&mut self, key: &EtaKey, entry: &EtaEntry) -> Result<()>;
}

#[async_trait]
pub trait ZoneRepo {
    /// All active zone configs.
    async fn active_zones(&mut self) -> Result<Vec<HotZone>>;
    async fn get_quota(
        &mut self,
        zone_id: &Id<HotZone>,
        date: NaiveDate,
        hour: u8,
    ) -> Result<Option<QuotaCounter>>;
    async fn put_quota(&mut self, counter: &QuotaCounter) -> Result<()>;
}

#[async_trait]
pub trait StatsRepo {
    async fn driver_day_stats(
        &mut self,
        driver_id: &Id<Driver>,
        date: NaiveDate,
    ) -> Result<DayStats>;
    /// Fleet-wide average of today's per-driver earnings, used by the
    /// earnings-balance scoring feature.
    async fn fleet_avg_earnings(&mut self, date: NaiveDate) -> Result<f64>;
}

pub trait DatabaseOperations:
    DriverRepo
    + PassengerRepo
    + OrderRepo
    + DispatchLogRepo
    + RejectionRepo
    + RatingRepo
    + PatternRepo
    + EtaRepo
    + ZoneRepo
    + StatsRepo
    + Send
{
}

/// A dispatch database. Concurrent access happens by cloning the handle;
/// implementations serialize batched writes per entity key themselves.
pub trait Database: Clone + Send + Sync + Sized + 'static {
    type Handle: DatabaseOperations;

    fn auto(&self) -> Self::Handle;
}
