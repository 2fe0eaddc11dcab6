use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::{driver::Driver, order::Order};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    TooFar,
    LowFare,
    UnwantedArea,
    OffDuty,
    Busy,
    Timeout,
    Other,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::TooFar => "TOO_FAR",
            RejectionReason::LowFare => "LOW_FARE",
            RejectionReason::UnwantedArea => "UNWANTED_AREA",
            RejectionReason::OffDuty => "OFF_DUTY",
            RejectionReason::Busy => "BUSY",
            RejectionReason::Timeout => "TIMEOUT",
            RejectionReason::Other => "OTHER",
        }
    }
}

impl FromStr for RejectionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOO_FAR" => Ok(RejectionReason::TooFar),
            "LOW_FARE" => Ok(RejectionReason::LowFare),
            "UNWANTED_AREA" => Ok(RejectionReason::UnwantedArea),
            "OFF_DUTY" => Ok(RejectionReason::OffDuty),
            "BUSY" => Ok(RejectionReason::Busy),
            "TIMEOUT" => Ok(RejectionReason::Timeout),
            "OTHER" => Ok(RejectionReason::Other),
            other => Err(format!("unknown rejection reason: {}", other)),
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Context of the offer at the moment it was turned down. This is the
/// training input of the pattern recomputation batch, so it is denormalized
/// on purpose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RejectionFeatures {
    pub pickup_distance_m: f64,
    pub trip_distance_m: Option<f64>,
    pub estimated_fare: f64,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub today_earnings: f64,
    pub today_trips: u32,
    pub today_online_hours: f64,
}

/// Append-only record of one driver turning down (or timing out on) one
/// offer.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RejectionRecord {
    pub id: Id<RejectionRecord>,
    pub order_id: Id<Order>,
    pub driver_id: Id<Driver>,
    pub reason: RejectionReason,
    pub features: RejectionFeatures,
    pub offered_at: DateTime<Utc>,
    pub rejected_at: DateTime<Utc>,
    pub response_ms: i64,
}

impl HasId for RejectionRecord {
    type IdType = String;
}
