use chrono::NaiveDate;
use dispatch::storage::Result;
use model::zone::{HotZone, QuotaCounter};
use sqlx::{Executor, Postgres};
use utility::id::Id;

use crate::data_model::{QuotaRow, ZoneRow};

use super::convert_error;

pub async fn active<'c, E>(executor: E) -> Result<Vec<HotZone>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(
        "
        SELECT
            id, name, center_lat, center_lng, radius_m, peak_hours,
            quota_normal, quota_peak, surge_threshold, surge_max_multiplier,
            surge_step, queue_enabled, max_queue_size, queue_timeout_minutes,
            active, priority
        FROM hot_zones
        WHERE active = TRUE
        ORDER BY priority DESC, id ASC;
        ",
    )
    .fetch_all(executor)
    .await
    .map(|rows: Vec<ZoneRow>| rows.into_iter().map(ZoneRow::to_model).collect())
    .map_err(convert_error)
}

pub async fn get_quota<'c, E>(
    executor: E,
    zone_id: &Id<HotZone>,
    date: NaiveDate,
    hour: u8,
) -> Result<Option<QuotaCounter>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(
        "
        SELECT zone_id, date, hour, limit_effective, used
        FROM hot_zone_quotas
        WHERE zone_id = $1 AND date = $2 AND hour = $3;
        ",
    )
    .bind(zone_id.raw())
    .bind(date)
    .bind(hour as i16)
    .fetch_optional(executor)
    .await
    .map(|row: Option<QuotaRow>| row.map(QuotaRow::to_model))
    .map_err(convert_error)
}

pub async fn put_quota<'c, E>(executor: E, counter: &QuotaCounter) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "
        INSERT INTO hot_zone_quotas(zone_id, date, hour, limit_effective, used)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (zone_id, date, hour)
        DO UPDATE SET
            limit_effective = EXCLUDED.limit_effective,
            used = EXCLUDED.used;
        ",
    )
    .bind(&counter.zone_id)
    .bind(counter.date)
    .bind(counter.hour as i16)
    .bind(counter.limit as i32)
    .bind(counter.used as i32)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}
