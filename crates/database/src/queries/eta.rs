use dispatch::storage::Result;
use model::eta::{EtaEntry, EtaKey};
use sqlx::{Executor, Postgres};

use crate::data_model::EtaRow;

use super::convert_error;

pub async fn get<'c, E>(executor: E, key: &EtaKey) -> Result<Option<EtaEntry>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(
        "
        SELECT
            origin_lat, origin_lng, dest_lat, dest_lng, hour,
            distance_m, duration_s, duration_in_traffic_s,
            cached_at, expires_at, hits
        FROM eta_cache
        WHERE origin_lat = $1 AND origin_lng = $2
          AND dest_lat = $3 AND dest_lng = $4
          AND hour = $5;
        ",
    )
    .bind(key.origin_lat)
    .bind(key.origin_lng)
    .bind(key.dest_lat)
    .bind(key.dest_lng)
    .bind(key.hour as i16)
    .fetch_optional(executor)
    .await
    .map(|row: Option<EtaRow>| row.map(EtaRow::to_entry))
    .map_err(convert_error)
}

pub async fn put<'c, E>(executor: E, key: &EtaKey, entry: &EtaEntry) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "
        INSERT INTO eta_cache(
            origin_lat, origin_lng, dest_lat, dest_lng, hour,
            distance_m, duration_s, duration_in_traffic_s,
            cached_at, expires_at, hits
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (origin_lat, origin_lng, dest_lat, dest_lng, hour)
        DO UPDATE SET
            distance_m = EXCLUDED.distance_m,
            duration_s = EXCLUDED.duration_s,
            duration_in_traffic_s = EXCLUDED.duration_in_traffic_s,
            cached_at = EXCLUDED.cached_at,
            expires_at = EXCLUDED.expires_at,
            hits = EXCLUDED.hits;
        ",
    )
    .bind(key.origin_lat)
    .bind(key.origin_lng)
    .bind(key.dest_lat)
    .bind(key.dest_lng)
    .bind(key.hour as i16)
    .bind(entry.distance_m)
    .bind(entry.duration_s)
    .bind(entry.duration_in_traffic_s)
    .bind(entry.cached_at)
    .bind(entry.expires_at)
    .bind(entry.hits as i64)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}
