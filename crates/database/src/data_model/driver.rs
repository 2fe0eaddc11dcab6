use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::storage::{DriverRepo, Result, StatsRepo};
use model::{
    driver::{Availability, DayStats, Driver, DriverFix, OfferFilters},
    GeoPoint,
};
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{
    queries::{driver, stats},
    PgStore,
};

#[derive(Debug, Clone, FromRow)]
pub struct DriverRow {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub plate: String,
    pub availability: String,
    pub last_lat: Option<f64>,
    pub last_lng: Option<f64>,
    pub last_speed: Option<f64>,
    pub last_bearing: Option<f64>,
    pub last_fix_at: Option<DateTime<Utc>>,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub rating: f64,
    pub rating_count: i32,
    pub total_trips: i64,
    pub total_earnings: f64,
    pub acceptance_rate: f64,
    pub tag: Option<String>,
}

impl DriverRow {
    pub fn to_model(self) -> Driver {
        Driver {
            id: Id::new(self.id),
            name: self.name,
            phone: self.phone,
            plate: self.plate,
            availability: self
                .availability
                .parse()
                .unwrap_or(Availability::Offline),
            last_fix: match (self.last_lat, self.last_lng, self.last_fix_at) {
                (Some(lat), Some(lng), Some(recorded_at)) => Some(DriverFix {
                    point: GeoPoint::new(lat, lng),
                    speed: self.last_speed,
                    bearing: self.last_bearing,
                    recorded_at,
                }),
                _ => None,
            },
            is_blocked: self.is_blocked,
            blocked_reason: self.blocked_reason,
            rating: self.rating,
            rating_count: self.rating_count.max(0) as u32,
            total_trips: self.total_trips.max(0) as u64,
            total_earnings: self.total_earnings,
            acceptance_rate: self.acceptance_rate,
            tag: self.tag.and_then(|tag| tag.parse().ok()),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DayStatsRow {
    pub earnings: f64,
    pub trips: i32,
    pub online_hours: f64,
}

impl DayStatsRow {
    pub fn to_model(self) -> DayStats {
        DayStats {
            earnings: self.earnings,
            trips: self.trips.max(0) as u32,
            online_hours: self.online_hours,
        }
    }
}

#[async_trait]
impl DriverRepo for PgStore {
    async fn get_driver(&mut self, id: &Id<Driver>) -> Result<Driver> {
        driver::get(&self.pool, id).await
    }

    async fn all_drivers(&mut self) -> Result<Vec<Driver>> {
        driver::get_all(&self.pool).await
    }

    async fn update_driver_presence(
        &mut self,
        id: &Id<Driver>,
        availability: Availability,
        fix: Option<DriverFix>,
        heartbeat: DateTime<Utc>,
    ) -> Result<()> {
        driver::update_presence(&self.pool, id, availability, fix, heartbeat)
            .await
    }

    async fn add_driver_trip(
        &mut self,
        id: &Id<Driver>,
        earnings: f64,
    ) -> Result<()> {
        driver::add_trip(&self.pool, id, earnings).await
    }

    async fn get_offer_filters(
        &mut self,
        id: &Id<Driver>,
    ) -> Result<OfferFilters> {
        driver::get_offer_filters(&self.pool, id).await
    }
}

#[async_trait]
impl StatsRepo for PgStore {
    async fn driver_day_stats(
        &mut self,
        driver_id: &Id<Driver>,
        date: chrono::NaiveDate,
    ) -> Result<DayStats> {
        stats::day_stats(&self.pool, driver_id, date).await
    }

    async fn fleet_avg_earnings(&mut self, date: chrono::NaiveDate) -> Result<f64> {
        stats::fleet_avg_earnings(&self.pool, date).await
    }
}
