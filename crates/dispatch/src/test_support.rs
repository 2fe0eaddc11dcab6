//! In-memory storage and entity builders behind the `test-helpers` feature.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
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
    GeoPoint,
};
use tokio::sync::RwLock;
use utility::id::Id;

use crate::storage::{
    AssignOutcome, Database, DatabaseOperations, DispatchLogRepo, DriverRepo,
    EtaRepo, OrderRepo, PassengerRepo, PatternRepo, RatingRepo, RejectionRepo,
    Result, StatsRepo, StorageError, ZoneRepo,
};

#[derive(Default)]
pub struct MemoryState {
    pub drivers: HashMap<Id<Driver>, Driver>,
    pub filters: HashMap<Id<Driver>, OfferFilters>,
    pub passengers: HashMap<Id<Passenger>, Passenger>,
    pub orders: HashMap<Id<Order>, Order>,
    pub dispatch_logs: Vec<DispatchLog>,
    pub rejections: Vec<RejectionRecord>,
    pub ratings: Vec<Rating>,
    pub patterns: HashMap<Id<Driver>, DriverPattern>,
    pub eta: HashMap<EtaKey, EtaEntry>,
    pub zones: Vec<HotZone>,
    pub quotas: HashMap<(String, NaiveDate, u8), QuotaCounter>,
    pub day_stats: HashMap<(String, NaiveDate), DayStats>,
    pub fleet_avg: HashMap<NaiveDate, f64>,
    /// Fault injection: the next N order writes fail with a storage error.
    pub fail_order_writes: u32,
}

/// Hash-map backed `Database` used by the test suites (and nothing else).
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_driver(&self, driver: Driver) {
        let mut state = self.state.write().await;
        state.drivers.insert(driver.id.clone(), driver);
    }

    pub async fn seed_passenger(&self, passenger: Passenger) {
        let mut state = self.state.write().await;
        state.passengers.insert(passenger.id.clone(), passenger);
    }

    pub async fn seed_zone(&self, zone: HotZone) {
        self.state.write().await.zones.push(zone);
    }

    pub async fn seed_pattern(&self, pattern: DriverPattern) {
        let mut state = self.state.write().await;
        state.patterns.insert(pattern.driver_id.clone(), pattern);
    }

    pub async fn seed_filters(&self, driver_id: Id<Driver>, filters: OfferFilters) {
        self.state.write().await.filters.insert(driver_id, filters);
    }

    pub async fn set_day_stats(
        &self,
        driver_id: &Id<Driver>,
        date: NaiveDate,
        stats: DayStats,
    ) {
        self.state
            .write()
            .await
            .day_stats
            .insert((driver_id.raw(), date), stats);
    }

    pub async fn set_fleet_avg(&self, date: NaiveDate, avg: f64) {
        self.state.write().await.fleet_avg.insert(date, avg);
    }

    pub async fn fail_order_writes(&self, count: u32) {
        self.state.write().await.fail_order_writes = count;
    }

    pub async fn order(&self, id: &Id<Order>) -> Option<Order> {
        self.state.read().await.orders.get(id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.state.read().await.orders.values().cloned().collect()
    }

    pub async fn dispatch_logs(&self) -> Vec<DispatchLog> {
        self.state.read().await.dispatch_logs.clone()
    }

    pub async fn rejections(&self) -> Vec<RejectionRecord> {
        self.state.read().await.rejections.clone()
    }

    pub async fn quota(
        &self,
        zone_id: &str,
        date: NaiveDate,
        hour: u8,
    ) -> Option<QuotaCounter> {
        self.state
            .read()
            .await
            .quotas
            .get(&(zone_id.to_owned(), date, hour))
            .cloned()
    }

    pub async fn driver(&self, id: &Id<Driver>) -> Option<Driver> {
        self.state.read().await.drivers.get(id).cloned()
    }
}

pub struct MemoryHandle {
    state: Arc<RwLock<MemoryState>>,
}

impl Database for MemoryDatabase {
    type Handle = MemoryHandle;

    fn auto(&self) -> Self::Handle {
        MemoryHandle {
            state: self.state.clone(),
        }
    }
}

fn storage_failure() -> StorageError {
    StorageError::Other("injected write failure".into())
}

#[async_trait]
impl DriverRepo for MemoryHandle {
    async fn get_driver(&mut self, id: &Id<Driver>) -> Result<Driver> {
        self.state
            .read()
            .await
            .drivers
            .get(id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn all_drivers(&mut self) -> Result<Vec<Driver>> {
        Ok(self.state.read().await.drivers.values().cloned().collect())
    }

    async fn update_driver_presence(
        &mut self,
        id: &Id<Driver>,
        availability: Availability,
        fix: Option<DriverFix>,
        _heartbeat: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(driver) = state.drivers.get_mut(id) {
            driver.availability = availability;
            driver.last_fix = fix;
        }
        Ok(())
    }

    async fn add_driver_trip(
        &mut self,
        id: &Id<Driver>,
        earnings: f64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let driver = state
            .drivers
            .get_mut(id)
            .ok_or(StorageError::NotFound)?;
        driver.total_trips += 1;
        driver.total_earnings += earnings;
        Ok(())
    }

    async fn get_offer_filters(
        &mut self,
        id: &Id<Driver>,
    ) -> Result<OfferFilters> {
        Ok(self
            .state
            .read()
            .await
            .filters
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PassengerRepo for MemoryHandle {
    async fn get_passenger(&mut self, id: &Id<Passenger>) -> Result<Passenger> {
        self.state
            .read()
            .await
            .passengers
            .get(id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn passenger_by_phone(
        &mut self,
        phone: &str,
    ) -> Result<Option<Passenger>> {
        Ok(self
            .state
            .read()
            .await
            .passengers
            .values()
            .find(|p| p.phone == phone)
            .cloned())
    }

    async fn insert_passenger(&mut self, passenger: &Passenger) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .passengers
            .insert(passenger.id.clone(), passenger.clone());
        Ok(())
    }

    async fn add_passenger_trip(&mut self, id: &Id<Passenger>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(passenger) = state.passengers.get_mut(id) {
            passenger.total_trips += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderRepo for MemoryHandle {
    async fn get_order(&mut self, id: &Id<Order>) -> Result<Order> {
        self.state
            .read()
            .await
            .orders
            .get(id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_order_writes > 0 {
            state.fail_order_writes -= 1;
            return Err(storage_failure());
        }
        state.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn update_order(
        &mut self,
        order: &Order,
        expected_status: OrderStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_order_writes > 0 {
            state.fail_order_writes -= 1;
            return Err(storage_failure());
        }
        let existing = state
            .orders
            .get(&order.id)
            .ok_or(StorageError::NotFound)?;
        if existing.status != expected_status {
            return Err(StorageError::Conflict);
        }
        state.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn try_assign_driver(
        &mut self,
        order_id: &Id<Order>,
        driver_id: &Id<Driver>,
        accepted_at: DateTime<Utc>,
    ) -> Result<AssignOutcome> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or(StorageError::NotFound)?;
        if order.status == OrderStatus::Offered && order.driver_id.is_none() {
            order.status = OrderStatus::Accepted;
            order.driver_id = Some(driver_id.clone());
            order.accepted_at = Some(accepted_at);
            Ok(AssignOutcome::Assigned)
        } else {
            Ok(AssignOutcome::Lost {
                status: order.status,
                driver_id: order.driver_id.clone(),
            })
        }
    }

    async fn orders_in_status(
        &mut self,
        status: OrderStatus,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.status == status && o.created_at <= created_before)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn active_order_for_driver(
        &mut self,
        driver_id: &Id<Driver>,
    ) -> Result<Option<Order>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .find(|o| {
                o.driver_id.as_ref() == Some(driver_id) && !o.status.is_terminal()
            })
            .cloned())
    }
}

#[async_trait]
impl DispatchLogRepo for MemoryHandle {
    async fn append_dispatch_log(&mut self, log: &DispatchLog) -> Result<()> {
        self.state.write().await.dispatch_logs.push(log.clone());
        Ok(())
    }

    async fn record_wave_acceptance(
        &mut self,
        order_id: &Id<Order>,
        wave_number: u32,
        acceptance: &WaveAcceptance,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let row = state
            .dispatch_logs
            .iter_mut()
            .find(|log| log.order_id == *order_id && log.wave_number == wave_number)
            .ok_or(StorageError::NotFound)?;
        row.acceptance = Some(acceptance.clone());
        Ok(())
    }
}

#[async_trait]
impl RejectionRepo for MemoryHandle {
    async fn append_rejection(&mut self, record: &RejectionRecord) -> Result<()> {
        self.state.write().await.rejections.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl RatingRepo for MemoryHandle {
    async fn append_rating(&mut self, rating: &Rating) -> Result<()> {
        self.state.write().await.ratings.push(rating.clone());
        Ok(())
    }
}

#[async_trait]
impl PatternRepo for MemoryHandle {
    async fn get_pattern(
        &mut self,
        driver_id: &Id<Driver>,
    ) -> Result<Option<DriverPattern>> {
        Ok(self.state.read().await.patterns.get(driver_id).cloned())
    }

    async fn put_pattern(&mut self, pattern: &DriverPattern) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .patterns
            .insert(pattern.driver_id.clone(), pattern.clone());
        Ok(())
    }
}

#[async_trait]
impl EtaRepo for MemoryHandle {
    async fn get_eta(&mut self, key: &EtaKey) -> Result<Option<EtaEntry>> {
        Ok(self.state.read().await.eta.get(key).copied())
    }

    async fn put_eta(&mut self, key: &EtaKey, entry: &EtaEntry) -> Result<()> {
        self.state.write().await.eta.insert(*key, *entry);
        Ok(())
    }
}

#[async_trait]
impl ZoneRepo for MemoryHandle {
    async fn active_zones(&mut self) -> Result<Vec<HotZone>> {
        Ok(self.state.read().await.zones.clone())
    }

    async fn get_quota(
        &mut self,
        zone_id: &Id<HotZone>,
        date: NaiveDate,
        hour: u8,
    ) -> Result<Option<QuotaCounter>> {
        Ok(self
            .state
            .read()
            .await
            .quotas
            .get(&(zone_id.raw(), date, hour))
            .cloned())
    }

    async fn put_quota(&mut self, counter: &QuotaCounter) -> Result<()> {
        let mut state = self.state.write().await;
        state.quotas.insert(
            (counter.zone_id.clone(), counter.date, counter.hour),
            counter.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl StatsRepo for MemoryHandle {
    async fn driver_day_stats(
        &mut self,
        driver_id: &Id<Driver>,
        date: NaiveDate,
    ) -> Result<DayStats> {
        Ok(self
            .state
            .read()
            .await
            .day_stats
            .get(&(driver_id.raw(), date))
            .copied()
            .unwrap_or_default())
    }

    async fn fleet_avg_earnings(&mut self, date: NaiveDate) -> Result<f64> {
        Ok(self
            .state
            .read()
            .await
            .fleet_avg
            .get(&date)
            .copied()
            .unwrap_or(0.0))
    }
}

impl DatabaseOperations for MemoryHandle {}

/// Fixed instant used across the test suites.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

pub fn sample_driver(id: &str, rating: f64) -> Driver {
    Driver {
        id: Id::new(id.to_owned()),
        name: format!("driver {}", id),
        phone: format!("+886900{}", id.len()),
        plate: format!("TAX-{}", id),
        availability: Availability::Offline,
        last_fix: None,
        is_blocked: false,
        blocked_reason: None,
        rating,
        rating_count: 10,
        total_trips: 100,
        total_earnings: 10_000.0,
        acceptance_rate: 0.9,
        tag: None,
    }
}

pub fn sample_passenger(id: &str) -> Passenger {
    Passenger {
        id: Id::new(id.to_owned()),
        phone: format!("+886911{}", id.len()),
        name: Some(format!("passenger {}", id)),
        email: None,
        is_blocked: false,
        rating: 5.0,
        total_trips: 3,
    }
}

pub fn sample_zone(id: &str, name: &str, center: GeoPoint, radius_m: f64) -> HotZone {
    HotZone {
        id: Id::new(id.to_owned()),
        name: name.to_owned(),
        center,
        radius_m,
        peak_hours: Vec::new(),
        quota_normal: 10,
        quota_peak: 3,
        surge_threshold: 0.8,
        surge_max_multiplier: 1.5,
        surge_step: 0.1,
        queue_enabled: false,
        max_queue_size: 10,
        queue_timeout_minutes: 10,
        active: true,
        priority: 0,
    }
}
