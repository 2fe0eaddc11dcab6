use dispatch::storage::Result;
use model::rejection::RejectionRecord;
use sqlx::{Executor, Postgres};

use super::convert_error;

pub async fn append<'c, E>(executor: E, record: &RejectionRecord) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "
        INSERT INTO order_rejections(
            id, order_id, driver_id, reason,
            pickup_distance_m, trip_distance_m, estimated_fare,
            hour_of_day, day_of_week,
            today_earnings, today_trips, today_online_hours,
            offered_at, rejected_at, response_ms
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
        );
        ",
    )
    .bind(record.id.raw())
    .bind(record.order_id.raw())
    .bind(record.driver_id.raw())
    .bind(record.reason.as_str())
    .bind(record.features.pickup_distance_m)
    .bind(record.features.trip_distance_m)
    .bind(record.features.estimated_fare)
    .bind(record.features.hour_of_day as i16)
    .bind(record.features.day_of_week as i16)
    .bind(record.features.today_earnings)
    .bind(record.features.today_trips as i32)
    .bind(record.features.today_online_hours)
    .bind(record.offered_at)
    .bind(record.rejected_at)
    .bind(record.response_ms)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}
