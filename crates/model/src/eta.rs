use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::geo;

use crate::GeoPoint;

/// Cache key: both endpoints snapped to a quantization grid, plus the hour
/// of day. Trips between the same two cells in the same hour share an entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct EtaKey {
    pub origin_lat: i64,
    pub origin_lng: i64,
    pub dest_lat: i64,
    pub dest_lng: i64,
    pub hour: u8,
}

impl EtaKey {
    pub fn quantized(
        origin: &GeoPoint,
        destination: &GeoPoint,
        hour: u8,
        step_degrees: f64,
    ) -> Self {
        Self {
            origin_lat: geo::quantize(origin.latitude, step_degrees),
            origin_lng: geo::quantize(origin.longitude, step_degrees),
            dest_lat: geo::quantize(destination.latitude, step_degrees),
            dest_lng: geo::quantize(destination.longitude, step_degrees),
            hour,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtaEntry {
    pub distance_m: f64,
    pub duration_s: f64,
    pub duration_in_traffic_s: f64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hits: u64,
}

impl EtaEntry {
    /// An entry at or past its expiry is treated as absent.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
