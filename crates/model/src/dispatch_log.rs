use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::{driver::Driver, order::Order};

/// Relative weights of the candidate-scoring features. Defaults to an even
/// split; the snapshot in force is logged with every wave so outcomes can be
/// correlated with the weights that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScoreWeights {
    pub pickup_distance: f64,
    pub predicted_eta: f64,
    pub rejection_probability: f64,
    pub earnings_balance: f64,
    pub zone_preference: f64,
    pub rating: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            pickup_distance: 1.0 / 6.0,
            predicted_eta: 1.0 / 6.0,
            rejection_probability: 1.0 / 6.0,
            earnings_balance: 1.0 / 6.0,
            zone_preference: 1.0 / 6.0,
            rating: 1.0 / 6.0,
        }
    }
}

/// One ranked candidate inside a wave, in offer order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RankedCandidate {
    pub driver_id: Id<Driver>,
    pub score: f64,
    pub predicted_eta_s: f64,
    pub rejection_probability: f64,
    pub reason: String,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WaveAcceptance {
    pub driver_id: Id<Driver>,
    pub accepted_at: DateTime<Utc>,
    pub response_ms: i64,
}

/// Written once per wave, append-only.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DispatchLog {
    pub id: Id<DispatchLog>,
    pub order_id: Id<Order>,
    pub wave_number: u32,
    pub logged_at: DateTime<Utc>,
    pub candidates: Vec<RankedCandidate>,
    pub weights: ScoreWeights,
    pub acceptance: Option<WaveAcceptance>,
}

impl HasId for DispatchLog {
    type IdType = String;
}
