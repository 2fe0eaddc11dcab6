use chrono::{DateTime, Utc};
use dispatch::storage::{AssignOutcome, Result, StorageError};
use model::{
    driver::Driver,
    order::{Order, OrderStatus},
};
use sqlx::{Executor, PgPool, Postgres};
use utility::id::Id;

use crate::data_model::OrderRow;

use super::convert_error;

const ORDER_COLUMNS: &str = "
    id, passenger_id, driver_id, status,
    pickup_lat, pickup_lng, pickup_address,
    dest_lat, dest_lng, dest_address,
    payment, meter_amount, estimated_fare,
    actual_distance_m, actual_duration_s, photo_url,
    created_at, offered_at, accepted_at, arrived_at,
    started_at, completed_at, cancelled_at,
    reject_count, batch_number, dispatch_method,
    hour_of_day, day_of_week, cancel_reason, cancelled_by,
    surge_multiplier, zone_name
";

pub async fn get<'c, E>(executor: E, id: &Id<Order>) -> Result<Order>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(&format!(
        "SELECT {} FROM orders WHERE id = $1;",
        ORDER_COLUMNS
    ))
    .bind(id.raw())
    .fetch_one(executor)
    .await
    .map(|row: OrderRow| row.to_model())
    .map_err(convert_error)
}

pub async fn insert<'c, E>(executor: E, order: &Order) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "
        INSERT INTO orders(
            id, passenger_id, driver_id, status,
            pickup_lat, pickup_lng, pickup_address,
            dest_lat, dest_lng, dest_address,
            payment, meter_amount, estimated_fare,
            actual_distance_m, actual_duration_s, photo_url,
            created_at, offered_at, accepted_at, arrived_at,
            started_at, completed_at, cancelled_at,
            reject_count, batch_number, dispatch_method,
            hour_of_day, day_of_week, cancel_reason, cancelled_by,
            surge_multiplier, zone_name
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
            $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
            $31, $32
        );
        ",
    )
    .bind(order.id.raw())
    .bind(order.passenger_id.raw())
    .bind(order.driver_id.as_ref().map(|id| id.raw()))
    .bind(order.status.as_str())
    .bind(order.pickup.point.latitude)
    .bind(order.pickup.point.longitude)
    .bind(&order.pickup.address)
    .bind(order.destination.as_ref().map(|place| place.point.latitude))
    .bind(order.destination.as_ref().map(|place| place.point.longitude))
    .bind(
        order
            .destination
            .as_ref()
            .and_then(|place| place.address.clone()),
    )
    .bind(order.payment.as_str())
    .bind(order.meter_amount)
    .bind(order.estimated_fare)
    .bind(order.actual_distance_m)
    .bind(order.actual_duration_s)
    .bind(&order.photo_url)
    .bind(order.created_at)
    .bind(order.offered_at)
    .bind(order.accepted_at)
    .bind(order.arrived_at)
    .bind(order.started_at)
    .bind(order.completed_at)
    .bind(order.cancelled_at)
    .bind(order.reject_count as i32)
    .bind(order.batch_number as i32)
    .bind(order.dispatch_method.as_str())
    .bind(order.hour_of_day as i16)
    .bind(order.day_of_week as i16)
    .bind(&order.cancel_reason)
    .bind(order.cancelled_by.map(|actor| actor.as_str()))
    .bind(order.surge_multiplier)
    .bind(&order.zone_name)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(convert_error)
}

/// Full-row update guarded on the status column; a zero-row update with an
/// existing row means the guard lost, which the caller treats as Conflict.
pub async fn update_guarded(
    pool: &PgPool,
    order: &Order,
    expected_status: OrderStatus,
) -> Result<()> {
    let result = sqlx::query(
        "
        UPDATE orders SET
            driver_id = $3,
            status = $4,
            meter_amount = $5,
            actual_distance_m = $6,
            actual_duration_s = $7,
            photo_url = $8,
            offered_at = $9,
            accepted_at = $10,
            arrived_at = $11,
            started_at = $12,
            completed_at = $13,
            cancelled_at = $14,
            reject_count = $15,
            batch_number = $16,
            cancel_reason = $17,
            cancelled_by = $18,
            surge_multiplier = $19,
            estimated_fare = $20
        WHERE id = $1 AND status = $2;
        ",
    )
    .bind(order.id.raw())
    .bind(expected_status.as_str())
    .bind(order.driver_id.as_ref().map(|id| id.raw()))
    .bind(order.status.as_str())
    .bind(order.meter_amount)
    .bind(order.actual_distance_m)
    .bind(order.actual_duration_s)
    .bind(&order.photo_url)
    .bind(order.offered_at)
    .bind(order.accepted_at)
    .bind(order.arrived_at)
    .bind(order.started_at)
    .bind(order.completed_at)
    .bind(order.cancelled_at)
    .bind(order.reject_count as i32)
    .bind(order.batch_number as i32)
    .bind(&order.cancel_reason)
    .bind(order.cancelled_by.map(|actor| actor.as_str()))
    .bind(order.surge_multiplier)
    .bind(order.estimated_fare)
    .execute(pool)
    .await
    .map_err(convert_error)?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let exists: Option<(String,)> =
        sqlx::query_as("SELECT status FROM orders WHERE id = $1;")
            .bind(order.id.raw())
            .fetch_optional(pool)
            .await
            .map_err(convert_error)?;
    match exists {
        Some(_) => Err(StorageError::Conflict),
        None => Err(StorageError::NotFound),
    }
}

/// The acceptance race: one statement, winner takes the row.
pub async fn try_assign_driver(
    pool: &PgPool,
    order_id: &Id<Order>,
    driver_id: &Id<Driver>,
    accepted_at: DateTime<Utc>,
) -> Result<AssignOutcome> {
    let result = sqlx::query(
        "
        UPDATE orders SET
            status = 'ACCEPTED',
            driver_id = $2,
            accepted_at = $3
        WHERE id = $1 AND status = 'OFFERED' AND driver_id IS NULL;
        ",
    )
    .bind(order_id.raw())
    .bind(driver_id.raw())
    .bind(accepted_at)
    .execute(pool)
    .await
    .map_err(convert_error)?;

    if result.rows_affected() == 1 {
        return Ok(AssignOutcome::Assigned);
    }

    let row: (String, Option<String>) =
        sqlx::query_as("SELECT status, driver_id FROM orders WHERE id = $1;")
            .bind(order_id.raw())
            .fetch_one(pool)
            .await
            .map_err(convert_error)?;
    Ok(AssignOutcome::Lost {
        status: row.0.parse().unwrap_or(OrderStatus::Cancelled),
        driver_id: row.1.map(Id::new),
    })
}

pub async fn in_status<'c, E>(
    executor: E,
    status: OrderStatus,
    created_before: DateTime<Utc>,
) -> Result<Vec<Order>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(&format!(
        "
        SELECT {}
        FROM orders
        WHERE status = $1 AND created_at <= $2
        ORDER BY created_at ASC;
        ",
        ORDER_COLUMNS
    ))
    .bind(status.as_str())
    .bind(created_before)
    .fetch_all(executor)
    .await
    .map(|rows: Vec<OrderRow>| rows.into_iter().map(OrderRow::to_model).collect())
    .map_err(convert_error)
}

pub async fn active_for_driver<'c, E>(
    executor: E,
    driver_id: &Id<Driver>,
) -> Result<Option<Order>>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as(&format!(
        "
        SELECT {}
        FROM orders
        WHERE driver_id = $1 AND status NOT IN ('DONE', 'CANCELLED')
        LIMIT 1;
        ",
        ORDER_COLUMNS
    ))
    .bind(driver_id.raw())
    .fetch_optional(executor)
    .await
    .map(|row: Option<OrderRow>| row.map(OrderRow::to_model))
    .map_err(convert_error)
}
