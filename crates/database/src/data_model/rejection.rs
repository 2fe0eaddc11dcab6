use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::storage::{RejectionRepo, Result};
use model::rejection::{
    RejectionFeatures, RejectionReason, RejectionRecord,
};
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{queries::rejection, PgStore};

#[derive(Debug, Clone, FromRow)]
pub struct RejectionRow {
    pub id: String,
    pub order_id: String,
    pub driver_id: String,
    pub reason: String,
    pub pickup_distance_m: f64,
    pub trip_distance_m: Option<f64>,
    pub estimated_fare: f64,
    pub hour_of_day: i16,
    pub day_of_week: i16,
    pub today_earnings: f64,
    pub today_trips: i32,
    pub today_online_hours: f64,
    pub offered_at: DateTime<Utc>,
    pub rejected_at: DateTime<Utc>,
    pub response_ms: i64,
}

impl RejectionRow {
    pub fn to_model(self) -> RejectionRecord {
        RejectionRecord {
            id: Id::new(self.id),
            order_id: Id::new(self.order_id),
            driver_id: Id::new(self.driver_id),
            reason: self.reason.parse().unwrap_or(RejectionReason::Other),
            features: RejectionFeatures {
                pickup_distance_m: self.pickup_distance_m,
                trip_distance_m: self.trip_distance_m,
                estimated_fare: self.estimated_fare,
                hour_of_day: self.hour_of_day.clamp(0, 23) as u8,
                day_of_week: self.day_of_week.clamp(0, 6) as u8,
                today_earnings: self.today_earnings,
                today_trips: self.today_trips.max(0) as u32,
                today_online_hours: self.today_online_hours,
            },
            offered_at: self.offered_at,
            rejected_at: self.rejected_at,
            response_ms: self.response_ms,
        }
    }
}

#[async_trait]
impl RejectionRepo for PgStore {
    async fn append_rejection(&mut self, record: &RejectionRecord) -> Result<()> {
        rejection::append(&self.pool, record).await
    }
}
