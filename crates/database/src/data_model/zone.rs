use async_trait::async_trait;
use chrono::NaiveDate;
use dispatch::storage::{Result, ZoneRepo};
use model::{
    zone::{HotZone, QuotaCounter},
    GeoPoint,
};
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{
    data_model::from_json_text,
    queries::zone,
    PgStore,
};

#[derive(Debug, Clone, FromRow)]
pub struct ZoneRow {
    pub id: String,
    pub name: String,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_m: f64,
    pub peak_hours: Option<String>,
    pub quota_normal: i32,
    pub quota_peak: i32,
    pub surge_threshold: f64,
    pub surge_max_multiplier: f64,
    pub surge_step: f64,
    pub queue_enabled: bool,
    pub max_queue_size: i32,
    pub queue_timeout_minutes: i32,
    pub active: bool,
    pub priority: i32,
}

impl ZoneRow {
    pub fn to_model(self) -> HotZone {
        HotZone {
            id: Id::new(self.id),
            name: self.name,
            center: GeoPoint::new(self.center_lat, self.center_lng),
            radius_m: self.radius_m,
            peak_hours: from_json_text(self.peak_hours, Vec::new()),
            quota_normal: self.quota_normal.max(0) as u32,
            quota_peak: self.quota_peak.max(0) as u32,
            surge_threshold: self.surge_threshold,
            surge_max_multiplier: self.surge_max_multiplier,
            surge_step: self.surge_step,
            queue_enabled: self.queue_enabled,
            max_queue_size: self.max_queue_size.max(0) as u32,
            queue_timeout_minutes: self.queue_timeout_minutes.max(0) as u32,
            active: self.active,
            priority: self.priority,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct QuotaRow {
    pub zone_id: String,
    pub date: NaiveDate,
    pub hour: i16,
    pub limit_effective: i32,
    pub used: i32,
}

impl QuotaRow {
    pub fn to_model(self) -> QuotaCounter {
        QuotaCounter {
            zone_id: self.zone_id,
            date: self.date,
            hour: self.hour.clamp(0, 23) as u8,
            limit: self.limit_effective.max(0) as u32,
            used: self.used.max(0) as u32,
        }
    }
}

#[async_trait]
impl ZoneRepo for PgStore {
    async fn active_zones(&mut self) -> Result<Vec<HotZone>> {
        zone::active(&self.pool).await
    }

    async fn get_quota(
        &mut self,
        zone_id: &Id<HotZone>,
        date: NaiveDate,
        hour: u8,
    ) -> Result<Option<QuotaCounter>> {
        zone::get_quota(&self.pool, zone_id, date, hour).await
    }

    async fn put_quota(&mut self, counter: &QuotaCounter) -> Result<()> {
        zone::put_quota(&self.pool, counter).await
    }
}
