use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::storage::{DispatchLogRepo, Result};
use model::{
    dispatch_log::{
        DispatchLog, RankedCandidate, ScoreWeights, WaveAcceptance,
    },
    order::Order,
};
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{
    data_model::{from_json_text, to_json_text},
    queries::dispatch_log,
    PgStore,
};

#[derive(Debug, Clone, FromRow)]
pub struct DispatchLogRow {
    pub id: String,
    pub order_id: String,
    pub wave_number: i32,
    pub logged_at: DateTime<Utc>,
    pub candidates: Option<String>,
    pub weights: Option<String>,
    pub accepted_by: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub response_ms: Option<i64>,
}

impl DispatchLogRow {
    pub fn to_model(self) -> DispatchLog {
        let candidates: Vec<RankedCandidate> =
            from_json_text(self.candidates, Vec::new());
        DispatchLog {
            id: Id::new(self.id),
            order_id: Id::new(self.order_id),
            wave_number: self.wave_number.max(0) as u32,
            logged_at: self.logged_at,
            candidates,
            weights: from_json_text(self.weights, ScoreWeights::default()),
            acceptance: match (self.accepted_by, self.accepted_at) {
                (Some(driver_id), Some(accepted_at)) => Some(WaveAcceptance {
                    driver_id: Id::new(driver_id),
                    accepted_at,
                    response_ms: self.response_ms.unwrap_or(0),
                }),
                _ => None,
            },
        }
    }

    pub fn from_model(log: &DispatchLog) -> Self {
        Self {
            id: log.id.raw(),
            order_id: log.order_id.raw(),
            wave_number: log.wave_number as i32,
            logged_at: log.logged_at,
            candidates: Some(to_json_text(&log.candidates)),
            weights: Some(to_json_text(&log.weights)),
            accepted_by: log
                .acceptance
                .as_ref()
                .map(|acceptance| acceptance.driver_id.raw()),
            accepted_at: log
                .acceptance
                .as_ref()
                .map(|acceptance| acceptance.accepted_at),
            response_ms: log
                .acceptance
                .as_ref()
                .map(|acceptance| acceptance.response_ms),
        }
    }
}

#[async_trait]
impl DispatchLogRepo for PgStore {
    async fn append_dispatch_log(&mut self, log: &DispatchLog) -> Result<()> {
        dispatch_log::append(&self.pool, log).await
    }

    async fn record_wave_acceptance(
        &mut self,
        order_id: &Id<Order>,
        wave_number: u32,
        acceptance: &WaveAcceptance,
    ) -> Result<()> {
        dispatch_log::record_acceptance(
            &self.pool,
            order_id,
            wave_number,
            acceptance,
        )
        .await
    }
}
