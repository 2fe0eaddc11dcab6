use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::storage::{EtaRepo, Result};
use model::eta::{EtaEntry, EtaKey};
use sqlx::prelude::FromRow;

use crate::{queries::eta, PgStore};

#[derive(Debug, Clone, FromRow)]
pub struct EtaRow {
    pub origin_lat: i64,
    pub origin_lng: i64,
    pub dest_lat: i64,
    pub dest_lng: i64,
    pub hour: i16,
    pub distance_m: f64,
    pub duration_s: f64,
    pub duration_in_traffic_s: f64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hits: i64,
}

impl EtaRow {
    pub fn to_entry(self) -> EtaEntry {
        EtaEntry {
            distance_m: self.distance_m,
            duration_s: self.duration_s,
            duration_in_traffic_s: self.duration_in_traffic_s,
            cached_at: self.cached_at,
            expires_at: self.expires_at,
            hits: self.hits.max(0) as u64,
        }
    }
}

#[async_trait]
impl EtaRepo for PgStore {
    async fn get_eta(&mut self, key: &EtaKey) -> Result<Option<EtaEntry>> {
        eta::get(&self.pool, key).await
    }

    async fn put_eta(&mut self, key: &EtaKey, entry: &EtaEntry) -> Result<()> {
        eta::put(&self.pool, key, entry).await
    }
}
