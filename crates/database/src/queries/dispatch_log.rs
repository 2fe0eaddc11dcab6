use dispatch::storage::{Result, StorageError};
use model::{
    dispatch_log::{DispatchLog, WaveAcceptance},
    order::Order,
};
use sqlx::{Executor, Postgres};
use utility::id::Id;

use crate::data_model::DispatchLogRow;

use super::convert_error;

pub async fn append<'c, E>(executor: E, log: &DispatchLog) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = DispatchLogRow::from_model(log);
    sqlx::query(
        "
        INSERT INTO dispatch_logs(
            id, order_id, wave_number, logged_at,
            candidates, weights, accepted_by, accepted_at, response_ms
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9);
        ",
    )
    .bind(row.id)
    .bind(row.order_id)
    .bind(row.wave_number)
    .bind(row.logged_at)
    .bind(row.candidates)
    .bind(row.weights)
    .bind(row.accepted_by)
    .bind(row.accepted_at)
    .bind(row.response_ms)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}

pub async fn record_acceptance<'c, E>(
    executor: E,
    order_id: &Id<Order>,
    wave_number: u32,
    acceptance: &WaveAcceptance,
) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "
        UPDATE dispatch_logs SET
            accepted_by = $3,
            accepted_at = $4,
            response_ms = $5
        WHERE order_id = $1 AND wave_number = $2;
        ",
    )
    .bind(order_id.raw())
    .bind(wave_number as i32)
    .bind(acceptance.driver_id.raw())
    .bind(acceptance.accepted_at)
    .bind(acceptance.response_ms)
    .execute(executor)
    .await
    .map_err(convert_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}
