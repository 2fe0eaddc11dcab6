use chrono::NaiveDate;
use dispatch::storage::Result;
use model::driver::{DayStats, Driver};
use sqlx::{Executor, Postgres};
use utility::id::Id;

use crate::data_model::driver::DayStatsRow;

use super::convert_error;

pub async fn day_stats<'c, E>(
    executor: E,
    driver_id: &Id<Driver>,
    date: NaiveDate,
) -> Result<DayStats>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: Option<DayStatsRow> = sqlx::query_as(
        "
        SELECT earnings, trips, online_hours
        FROM driver_day_stats
        WHERE driver_id = $1 AND date = $2;
        ",
    )
    .bind(driver_id.raw())
    .bind(date)
    .fetch_optional(executor)
    .await
    .map_err(convert_error)?;

    Ok(row.map(DayStatsRow::to_model).unwrap_or_default())
}

pub async fn fleet_avg_earnings<'c, E>(executor: E, date: NaiveDate) -> Result<f64>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT AVG(earnings) FROM driver_day_stats WHERE date = $1;",
    )
    .bind(date)
    .fetch_one(executor)
    .await
    .map_err(convert_error)?;

    Ok(row.0.unwrap_or(0.0))
}
