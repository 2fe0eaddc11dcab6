use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::Id;

use crate::driver::{Driver, DriverTag};

/// Acceptance rates per trip-length bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketRates {
    pub short: f64,
    pub medium: f64,
    pub long: f64,
}

impl Default for BucketRates {
    fn default() -> Self {
        Self {
            short: 0.5,
            medium: 0.5,
            long: 0.5,
        }
    }
}

/// Per-driver acceptance behavior, recomputed offline from the rejection
/// stream and read on the dispatch hot path. One record per driver.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverPattern {
    pub driver_id: Id<Driver>,
    /// hour (0..24) → acceptance rate in [0,1]; missing hours have no data.
    pub hourly_acceptance: HashMap<u8, f64>,
    /// zone name → acceptance rate in [0,1].
    pub zone_acceptance: HashMap<String, f64>,
    pub avg_accepted_pickup_m: f64,
    pub max_accepted_pickup_m: f64,
    pub bucket_rates: BucketRates,
    pub earnings_threshold: f64,
    pub tag: Option<DriverTag>,
    pub last_calculated: DateTime<Utc>,
    pub data_points: u64,
}

impl DriverPattern {
    /// A neutral pattern for drivers the batch job has not seen yet.
    pub fn empty(driver_id: Id<Driver>, now: DateTime<Utc>) -> Self {
        Self {
            driver_id,
            hourly_acceptance: HashMap::new(),
            zone_acceptance: HashMap::new(),
            avg_accepted_pickup_m: 0.0,
            max_accepted_pickup_m: 0.0,
            bucket_rates: BucketRates::default(),
            earnings_threshold: f64::MAX,
            tag: None,
            last_calculated: now,
            data_points: 0,
        }
    }
}
