use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::{ExampleData, GeoPoint};

/// Admin-edited configuration of one hot zone. Geometry is a circle around
/// the center; overlapping zones resolve by priority, then by lower id.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HotZone {
    pub id: Id<HotZone>,
    pub name: String,
    pub center: GeoPoint,
    pub radius_m: f64,
    pub peak_hours: Vec<u8>,
    pub quota_normal: u32,
    pub quota_peak: u32,
    /// Utilization fraction above which surge starts.
    pub surge_threshold: f64,
    pub surge_max_multiplier: f64,
    pub surge_step: f64,
    pub queue_enabled: bool,
    pub max_queue_size: u32,
    pub queue_timeout_minutes: u32,
    pub active: bool,
    pub priority: i32,
}

impl HasId for HotZone {
    type IdType = String;
}

impl HotZone {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        self.center.distance_m(point) <= self.radius_m
    }

    pub fn effective_limit(&self, hour: u8) -> u32 {
        if self.peak_hours.contains(&hour) {
            self.quota_peak
        } else {
            self.quota_normal
        }
    }
}

/// Hourly admission ticket counter of one zone. `used` never exceeds
/// `limit`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCounter {
    pub zone_id: String,
    pub date: NaiveDate,
    pub hour: u8,
    pub limit: u32,
    pub used: u32,
}

impl ExampleData for HotZone {
    fn example_data() -> Self {
        Self {
            id: Id::new("zone_east_market".to_owned()),
            name: "EastMarket".to_owned(),
            center: GeoPoint::new(23.987, 121.606),
            radius_m: 800.0,
            peak_hours: vec![7, 8, 17, 18],
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
}
