use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::{driver::Driver, passenger::Passenger, ExampleData, GeoPoint, Place};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Offered,
    Accepted,
    Arrived,
    OnTrip,
    Settling,
    Done,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Offered => "OFFERED",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::Arrived => "ARRIVED",
            OrderStatus::OnTrip => "ON_TRIP",
            OrderStatus::Settling => "SETTLING",
            OrderStatus::Done => "DONE",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Done | OrderStatus::Cancelled)
    }

    /// Cancellation is only legal before the trip itself starts.
    pub fn cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Offered | OrderStatus::Accepted | OrderStatus::Arrived
        )
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFERED" => Ok(OrderStatus::Offered),
            "ACCEPTED" => Ok(OrderStatus::Accepted),
            "ARRIVED" => Ok(OrderStatus::Arrived),
            "ON_TRIP" => Ok(OrderStatus::OnTrip),
            "SETTLING" => Ok(OrderStatus::Settling),
            "DONE" => Ok(OrderStatus::Done),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentKind {
    Cash,
    LoveCardPhysical,
    Other,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Cash => "CASH",
            PaymentKind::LoveCardPhysical => "LOVE_CARD_PHYSICAL",
            PaymentKind::Other => "OTHER",
        }
    }
}

impl FromStr for PaymentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CASH" => Ok(PaymentKind::Cash),
            "LOVE_CARD_PHYSICAL" => Ok(PaymentKind::LoveCardPhysical),
            "OTHER" => Ok(PaymentKind::Other),
            other => Err(format!("unknown payment kind: {}", other)),
        }
    }
}

/// Who caused a transition. Authority checks in the state machine key off
/// this, not off the connection the request arrived on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    Passenger,
    Driver,
    Admin,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Passenger => "passenger",
            Actor::Driver => "driver",
            Actor::Admin => "admin",
            Actor::System => "system",
        }
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passenger" => Ok(Actor::Passenger),
            "driver" => Ok(Actor::Driver),
            "admin" => Ok(Actor::Admin),
            "system" => Ok(Actor::System),
            other => Err(format!("unknown actor: {}", other)),
        }
    }
}

/// How the order was (or will be) dispatched.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum DispatchMethod {
    Ranked,
    Broadcast,
    ZoneQueue,
}

impl DispatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMethod::Ranked => "ranked",
            DispatchMethod::Broadcast => "broadcast",
            DispatchMethod::ZoneQueue => "zone-queue",
        }
    }
}

impl FromStr for DispatchMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ranked" => Ok(DispatchMethod::Ranked),
            "broadcast" => Ok(DispatchMethod::Broadcast),
            "zone-queue" => Ok(DispatchMethod::ZoneQueue),
            other => Err(format!("unknown dispatch method: {}", other)),
        }
    }
}

/// Meter data the driver submits when the trip ends.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub meter_amount: f64,
    pub distance_m: f64,
    pub duration_s: f64,
    pub photo_url: Option<String>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Id<Order>,
    pub passenger_id: Id<Passenger>,
    pub driver_id: Option<Id<Driver>>,
    pub status: OrderStatus,
    pub pickup: Place,
    pub destination: Option<Place>,
    pub payment: PaymentKind,
    pub meter_amount: Option<f64>,
    pub estimated_fare: f64,
    pub actual_distance_m: Option<f64>,
    pub actual_duration_s: Option<f64>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub offered_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub reject_count: u32,
    pub batch_number: u32,
    pub dispatch_method: DispatchMethod,
    /// Snapshot of the local hour and weekday at creation, kept denormalized
    /// for later analysis of the rejection stream.
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<Actor>,
    pub surge_multiplier: f64,
    pub zone_name: Option<String>,
}

impl HasId for Order {
    type IdType = String;
}

impl ExampleData for Order {
    fn example_data() -> Self {
        Self {
            id: Id::new("ord_000001".to_owned()),
            passenger_id: Id::new("pax_000001".to_owned()),
            driver_id: None,
            status: OrderStatus::Offered,
            pickup: Place::new(
                GeoPoint::new(23.993, 121.601),
                Some("Hualien Station".to_owned()),
            ),
            destination: Some(Place::new(
                GeoPoint::new(23.987, 121.606),
                Some("East Market".to_owned()),
            )),
            payment: PaymentKind::Cash,
            meter_amount: None,
            estimated_fare: 185.0,
            actual_distance_m: None,
            actual_duration_s: None,
            photo_url: None,
            created_at: Utc::now(),
            offered_at: None,
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            reject_count: 0,
            batch_number: 1,
            dispatch_method: DispatchMethod::Ranked,
            hour_of_day: 10,
            day_of_week: 2,
            cancel_reason: None,
            cancelled_by: None,
            surge_multiplier: 1.0,
            zone_name: None,
        }
    }
}
