use dispatch::storage::{Result, StorageError};
use model::passenger::Passenger;
use sqlx::{Executor, Postgres};
use utility::id::Id;

use crate::data_model::PassengerRow;

use super::convert_error;

pub async fn get<'c, E>(executor: E, id: &Id<Passenger>) -> Result<Passenger>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(
        "
        SELECT id, phone, name, email, is_blocked, rating, total_trips
        FROM passengers
        WHERE id = $1;
        ",
    )
    .bind(id.raw())
    .fetch_one(executor)
    .await
    .map(|row: PassengerRow| row.to_model())
    .map_err(convert_error)
}

pub async fn by_phone<'c, E>(executor: E, phone: &str) -> Result<Option<Passenger>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(
        "
        SELECT id, phone, name, email, is_blocked, rating, total_trips
        FROM passengers
        WHERE phone = $1;
        ",
    )
    .bind(phone)
    .fetch_optional(executor)
    .await
    .map(|row: Option<PassengerRow>| row.map(PassengerRow::to_model))
    .map_err(convert_error)
}

pub async fn insert<'c, E>(executor: E, passenger: &Passenger) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "
        INSERT INTO passengers(
            id, phone, name, email, is_blocked, rating, total_trips
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7);
        ",
    )
    .bind(passenger.id.raw())
    .bind(&passenger.phone)
    .bind(&passenger.name)
    .bind(&passenger.email)
    .bind(passenger.is_blocked)
    .bind(passenger.rating)
    .bind(passenger.total_trips as i64)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}

pub async fn add_trip<'c, E>(executor: E, id: &Id<Passenger>) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE passengers SET total_trips = total_trips + 1 WHERE id = $1;",
    )
    .bind(id.raw())
    .execute(executor)
    .await
    .map_err(convert_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}
