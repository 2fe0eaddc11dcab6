use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::{ExampleData, GeoPoint};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    Offline,
    Rest,
    Available,
    OnTrip,
    Blocked,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Offline => "OFFLINE",
            Availability::Rest => "REST",
            Availability::Available => "AVAILABLE",
            Availability::OnTrip => "ON_TRIP",
            Availability::Blocked => "BLOCKED",
        }
    }

    /// Whether a driver in this state may receive offers at all.
    pub fn dispatchable(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl FromStr for Availability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFLINE" => Ok(Availability::Offline),
            "REST" => Ok(Availability::Rest),
            "AVAILABLE" => Ok(Availability::Available),
            "ON_TRIP" => Ok(Availability::OnTrip),
            "BLOCKED" => Ok(Availability::Blocked),
            other => Err(format!("unknown availability: {}", other)),
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverTag {
    FastTurnover,
    LongDistance,
    HighVolume,
}

impl DriverTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverTag::FastTurnover => "FAST_TURNOVER",
            DriverTag::LongDistance => "LONG_DISTANCE",
            DriverTag::HighVolume => "HIGH_VOLUME",
        }
    }
}

impl FromStr for DriverTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAST_TURNOVER" => Ok(DriverTag::FastTurnover),
            "LONG_DISTANCE" => Ok(DriverTag::LongDistance),
            "HIGH_VOLUME" => Ok(DriverTag::HighVolume),
            other => Err(format!("unknown driver tag: {}", other)),
        }
    }
}

/// Last known geographic fix of a driver.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverFix {
    #[serde(flatten)]
    pub point: GeoPoint,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: Id<Driver>,
    pub name: String,
    pub phone: String,
    pub plate: String,
    pub availability: Availability,
    pub last_fix: Option<DriverFix>,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub rating: f64,
    pub rating_count: u32,
    pub total_trips: u64,
    pub total_earnings: f64,
    pub acceptance_rate: f64,
    pub tag: Option<DriverTag>,
}

impl HasId for Driver {
    type IdType = String;
}

/// Rolling same-day aggregates, read by candidate scoring and the rejection
/// predictor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DayStats {
    pub earnings: f64,
    pub trips: u32,
    pub online_hours: f64,
}

/// Driver-configured offer filters feeding the auto-accept score. Any filter
/// that disqualifies an offer zeroes the score.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OfferFilters {
    pub max_pickup_distance_m: Option<f64>,
    pub min_fare: Option<f64>,
    pub min_trip_distance_m: Option<f64>,
    pub active_hours: Option<Vec<u8>>,
    pub blacklisted_zones: Option<Vec<String>>,
}

impl ExampleData for Driver {
    fn example_data() -> Self {
        Self {
            id: Id::new("drv_000001".to_owned()),
            name: "Chen Wei".to_owned(),
            phone: "+886912345678".to_owned(),
            plate: "TAX-0217".to_owned(),
            availability: Availability::Available,
            last_fix: None,
            is_blocked: false,
            blocked_reason: None,
            rating: 4.8,
            rating_count: 152,
            total_trips: 1890,
            total_earnings: 384_200.0,
            acceptance_rate: 0.91,
            tag: Some(DriverTag::FastTurnover),
        }
    }
}
