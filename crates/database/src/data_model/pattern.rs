use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::storage::{PatternRepo, Result};
use model::{
    driver::Driver,
    pattern::{BucketRates, DriverPattern},
};
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{
    data_model::{from_json_text, to_json_text},
    queries::pattern,
    PgStore,
};

#[derive(Debug, Clone, FromRow)]
pub struct PatternRow {
    pub driver_id: String,
    pub hourly_acceptance: Option<String>,
    pub zone_acceptance: Option<String>,
    pub avg_accepted_pickup_m: f64,
    pub max_accepted_pickup_m: f64,
    pub bucket_rates: Option<String>,
    pub earnings_threshold: f64,
    pub tag: Option<String>,
    pub last_calculated: DateTime<Utc>,
    pub data_points: i64,
}

impl PatternRow {
    pub fn to_model(self) -> DriverPattern {
        DriverPattern {
            driver_id: Id::new(self.driver_id),
            hourly_acceptance: from_json_text(
                self.hourly_acceptance,
                HashMap::new(),
            ),
            zone_acceptance: from_json_text(self.zone_acceptance, HashMap::new()),
            avg_accepted_pickup_m: self.avg_accepted_pickup_m,
            max_accepted_pickup_m: self.max_accepted_pickup_m,
            bucket_rates: from_json_text(
                self.bucket_rates,
                BucketRates::default(),
            ),
            earnings_threshold: self.earnings_threshold,
            tag: self.tag.and_then(|tag| tag.parse().ok()),
            last_calculated: self.last_calculated,
            data_points: self.data_points.max(0) as u64,
        }
    }

    pub fn from_model(pattern: &DriverPattern) -> Self {
        Self {
            driver_id: pattern.driver_id.raw(),
            hourly_acceptance: Some(to_json_text(&pattern.hourly_acceptance)),
            zone_acceptance: Some(to_json_text(&pattern.zone_acceptance)),
            avg_accepted_pickup_m: pattern.avg_accepted_pickup_m,
            max_accepted_pickup_m: pattern.max_accepted_pickup_m,
            bucket_rates: Some(to_json_text(&pattern.bucket_rates)),
            earnings_threshold: pattern.earnings_threshold,
            tag: pattern.tag.map(|tag| tag.as_str().to_owned()),
            last_calculated: pattern.last_calculated,
            data_points: pattern.data_points as i64,
        }
    }
}

#[async_trait]
impl PatternRepo for PgStore {
    async fn get_pattern(
        &mut self,
        driver_id: &Id<Driver>,
    ) -> Result<Option<DriverPattern>> {
        pattern::get(&self.pool, driver_id).await
    }

    async fn put_pattern(&mut self, pattern: &DriverPattern) -> Result<()> {
        pattern::put(&self.pool, pattern).await
    }
}
