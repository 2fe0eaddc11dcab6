use dispatch::storage::Result;
use model::rating::Rating;
use sqlx::{Executor, Postgres};

use super::convert_error;

pub async fn append<'c, E>(executor: E, rating: &Rating) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "
        INSERT INTO ratings(
            id, order_id, passenger_id, driver_id, stars, comment, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7);
        ",
    )
    .bind(rating.id.raw())
    .bind(rating.order_id.raw())
    .bind(rating.passenger_id.raw())
    .bind(rating.driver_id.raw())
    .bind(rating.stars as i16)
    .bind(&rating.comment)
    .bind(rating.created_at)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}
