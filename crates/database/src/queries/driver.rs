use chrono::{DateTime, Utc};
use dispatch::storage::{Result, StorageError};
use model::driver::{Availability, Driver, DriverFix, OfferFilters};
use sqlx::{Executor, Postgres};
use utility::id::Id;

use crate::data_model::{from_json_text, DriverRow};

use super::convert_error;

const DRIVER_COLUMNS: &str = "
    id, name, phone, plate, availability,
    last_lat, last_lng, last_speed, last_bearing, last_fix_at,
    is_blocked, blocked_reason, rating, rating_count,
    total_trips, total_earnings, acceptance_rate, tag
";

pub async fn get<'c, E>(executor: E, id: &Id<Driver>) -> Result<Driver>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(&format!(
        "SELECT {} FROM drivers WHERE id = $1;",
        DRIVER_COLUMNS
    ))
    .bind(id.raw())
    .fetch_one(executor)
    .await
    .map(|row: DriverRow| row.to_model())
    .map_err(convert_error)
}

pub async fn get_all<'c, E>(executor: E) -> Result<Vec<Driver>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(&format!("SELECT {} FROM drivers;", DRIVER_COLUMNS))
        .fetch_all(executor)
        .await
        .map(|rows: Vec<DriverRow>| {
            rows.into_iter().map(DriverRow::to_model).collect()
        })
        .map_err(convert_error)
}

pub async fn update_presence<'c, E>(
    executor: E,
    id: &Id<Driver>,
    availability: Availability,
    fix: Option<DriverFix>,
    heartbeat: DateTime<Utc>,
) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "
        UPDATE drivers SET
            availability = $2,
            last_lat = $3,
            last_lng = $4,
            last_speed = $5,
            last_bearing = $6,
            last_fix_at = $7,
            heartbeat_at = $8
        WHERE id = $1;
        ",
    )
    .bind(id.raw())
    .bind(availability.as_str())
    .bind(fix.map(|fix| fix.point.latitude))
    .bind(fix.map(|fix| fix.point.longitude))
    .bind(fix.and_then(|fix| fix.speed))
    .bind(fix.and_then(|fix| fix.bearing))
    .bind(fix.map(|fix| fix.recorded_at))
    .bind(heartbeat)
    .execute(executor)
    .await
    .map_err(convert_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

pub async fn add_trip<'c, E>(
    executor: E,
    id: &Id<Driver>,
    earnings: f64,
) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "
        UPDATE drivers SET
            total_trips = total_trips + 1,
            total_earnings = total_earnings + $2
        WHERE id = $1;
        ",
    )
    .bind(id.raw())
    .bind(earnings)
    .execute(executor)
    .await
    .map_err(convert_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

pub async fn get_offer_filters<'c, E>(
    executor: E,
    id: &Id<Driver>,
) -> Result<OfferFilters>
where
    E: Executor<'c, Database = Postgres>,
{
    let raw: Option<(String,)> = sqlx::query_as(
        "SELECT filters FROM driver_filters WHERE driver_id = $1;",
    )
    .bind(id.raw())
    .fetch_optional(executor)
    .await
    .map_err(convert_error)?;

    Ok(from_json_text(
        raw.map(|(filters,)| filters),
        OfferFilters::default(),
    ))
}
