use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::{driver::Driver, order::Order, passenger::Passenger};

/// Attached to an order once it reaches DONE. Rating CRUD itself is an
/// external collaborator; the core only appends through the completion hook.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub id: Id<Rating>,
    pub order_id: Id<Order>,
    pub passenger_id: Id<Passenger>,
    pub driver_id: Id<Driver>,
    pub stars: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HasId for Rating {
    type IdType = String;
}
