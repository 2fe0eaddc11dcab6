use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::geo;

pub mod dispatch_log;
pub mod driver;
pub mod eta;
pub mod order;
pub mod passenger;
pub mod pattern;
pub mod rating;
pub mod rejection;
pub mod zone;

/// Example values for generated JSON schemas.
pub trait ExampleData {
    fn example_data() -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        geo::haversine_distance_m(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }

    pub fn in_valid_range(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A point with the human-readable address the caller supplied. The system
/// never geocodes; both parts arrive from outside.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    #[serde(flatten)]
    pub point: GeoPoint,
    pub address: Option<String>,
}

impl Place {
    pub fn new(point: GeoPoint, address: Option<String>) -> Self {
        Self { point, address }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geo_point_range_check() {
        assert!(GeoPoint::new(23.993, 121.601).in_valid_range());
        assert!(!GeoPoint::new(123.0, 121.601).in_valid_range());
        assert!(!GeoPoint::new(23.0, 181.0).in_valid_range());
    }
}
