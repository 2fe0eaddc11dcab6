use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::storage::{AssignOutcome, OrderRepo, Result};
use model::{
    driver::Driver,
    order::{DispatchMethod, Order, OrderStatus, PaymentKind},
    GeoPoint, Place,
};
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{queries::order, PgStore};

#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub id: String,
    pub passenger_id: String,
    pub driver_id: Option<String>,
    pub status: String,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub pickup_address: Option<String>,
    pub dest_lat: Option<f64>,
    pub dest_lng: Option<f64>,
    pub dest_address: Option<String>,
    pub payment: String,
    pub meter_amount: Option<f64>,
    pub estimated_fare: f64,
    pub actual_distance_m: Option<f64>,
    pub actual_duration_s: Option<f64>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub offered_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub reject_count: i32,
    pub batch_number: i32,
    pub dispatch_method: String,
    pub hour_of_day: i16,
    pub day_of_week: i16,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub surge_multiplier: f64,
    pub zone_name: Option<String>,
}

impl OrderRow {
    pub fn to_model(self) -> Order {
        Order {
            id: Id::new(self.id),
            passenger_id: Id::new(self.passenger_id),
            driver_id: self.driver_id.map(Id::new),
            status: self.status.parse().unwrap_or(OrderStatus::Cancelled),
            pickup: Place::new(
                GeoPoint::new(self.pickup_lat, self.pickup_lng),
                self.pickup_address,
            ),
            destination: match (self.dest_lat, self.dest_lng) {
                (Some(lat), Some(lng)) => {
                    Some(Place::new(GeoPoint::new(lat, lng), self.dest_address))
                }
                _ => None,
            },
            payment: self.payment.parse().unwrap_or(PaymentKind::Other),
            meter_amount: self.meter_amount,
            estimated_fare: self.estimated_fare,
            actual_distance_m: self.actual_distance_m,
            actual_duration_s: self.actual_duration_s,
            photo_url: self.photo_url,
            created_at: self.created_at,
            offered_at: self.offered_at,
            accepted_at: self.accepted_at,
            arrived_at: self.arrived_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            reject_count: self.reject_count.max(0) as u32,
            batch_number: self.batch_number.max(0) as u32,
            dispatch_method: self
                .dispatch_method
                .parse()
                .unwrap_or(DispatchMethod::Ranked),
            hour_of_day: self.hour_of_day.clamp(0, 23) as u8,
            day_of_week: self.day_of_week.clamp(0, 6) as u8,
            cancel_reason: self.cancel_reason,
            cancelled_by: self.cancelled_by.and_then(|actor| actor.parse().ok()),
            surge_multiplier: self.surge_multiplier,
            zone_name: self.zone_name,
        }
    }
}

#[async_trait]
impl OrderRepo for PgStore {
    async fn get_order(&mut self, id: &Id<Order>) -> Result<Order> {
        order::get(&self.pool, id).await
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        order::insert(&self.pool, order).await
    }

    async fn update_order(
        &mut self,
        order: &Order,
        expected_status: OrderStatus,
    ) -> Result<()> {
        order::update_guarded(&self.pool, order, expected_status).await
    }

    async fn try_assign_driver(
        &mut self,
        order_id: &Id<Order>,
        driver_id: &Id<Driver>,
        accepted_at: DateTime<Utc>,
    ) -> Result<AssignOutcome> {
        order::try_assign_driver(&self.pool, order_id, driver_id, accepted_at)
            .await
    }

    async fn orders_in_status(
        &mut self,
        status: OrderStatus,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Order>> {
        order::in_status(&self.pool, status, created_before).await
    }

    async fn active_order_for_driver(
        &mut self,
        driver_id: &Id<Driver>,
    ) -> Result<Option<Order>> {
        order::active_for_driver(&self.pool, driver_id).await
    }
}
