use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::ExampleData;

/// Unique by phone. A later login with the same phone rebinds to the
/// existing record instead of creating a new one.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Passenger {
    pub id: Id<Passenger>,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub is_blocked: bool,
    pub rating: f64,
    pub total_trips: u64,
}

impl HasId for Passenger {
    type IdType = String;
}

impl ExampleData for Passenger {
    fn example_data() -> Self {
        Self {
            id: Id::new("pax_000001".to_owned()),
            phone: "+886987654321".to_owned(),
            name: Some("Lin Mei".to_owned()),
            email: None,
            is_blocked: false,
            rating: 4.9,
            total_trips: 42,
        }
    }
}
