use dispatch::storage::Result;
use model::{driver::Driver, pattern::DriverPattern};
use sqlx::{Executor, Postgres};
use utility::id::Id;

use crate::data_model::PatternRow;

use super::convert_error;

pub async fn get<'c, E>(
    executor: E,
    driver_id: &Id<Driver>,
) -> Result<Option<DriverPattern>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(
        "
        SELECT
            driver_id, hourly_acceptance, zone_acceptance,
            avg_accepted_pickup_m, max_accepted_pickup_m, bucket_rates,
            earnings_threshold, tag, last_calculated, data_points
        FROM driver_patterns
        WHERE driver_id = $1;
        ",
    )
    .bind(driver_id.raw())
    .fetch_optional(executor)
    .await
    .map(|row: Option<PatternRow>| row.map(PatternRow::to_model))
    .map_err(convert_error)
}

pub async fn put<'c, E>(executor: E, pattern: &DriverPattern) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = PatternRow::from_model(pattern);
    sqlx::query(
        "
        INSERT INTO driver_patterns(
            driver_id, hourly_acceptance, zone_acceptance,
            avg_accepted_pickup_m, max_accepted_pickup_m, bucket_rates,
            earnings_threshold, tag, last_calculated, data_points
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (driver_id)
        DO UPDATE SET
            hourly_acceptance = EXCLUDED.hourly_acceptance,
            zone_acceptance = EXCLUDED.zone_acceptance,
            avg_accepted_pickup_m = EXCLUDED.avg_accepted_pickup_m,
            max_accepted_pickup_m = EXCLUDED.max_accepted_pickup_m,
            bucket_rates = EXCLUDED.bucket_rates,
            earnings_threshold = EXCLUDED.earnings_threshold,
            tag = EXCLUDED.tag,
            last_calculated = EXCLUDED.last_calculated,
            data_points = EXCLUDED.data_points;
        ",
    )
    .bind(row.driver_id)
    .bind(row.hourly_acceptance)
    .bind(row.zone_acceptance)
    .bind(row.avg_accepted_pickup_m)
    .bind(row.max_accepted_pickup_m)
    .bind(row.bucket_rates)
    .bind(row.earnings_threshold)
    .bind(row.tag)
    .bind(row.last_calculated)
    .bind(row.data_points)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}
