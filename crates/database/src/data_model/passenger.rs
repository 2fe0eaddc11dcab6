use async_trait::async_trait;
use dispatch::storage::{PassengerRepo, Result};
use model::passenger::Passenger;
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{queries::passenger, PgStore};

#[derive(Debug, Clone, FromRow)]
pub struct PassengerRow {
    pub id: String,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub is_blocked: bool,
    pub rating: f64,
    pub total_trips: i64,
}

impl PassengerRow {
    pub fn to_model(self) -> Passenger {
        Passenger {
            id: Id::new(self.id),
            phone: self.phone,
            name: self.name,
            email: self.email,
            is_blocked: self.is_blocked,
            rating: self.rating,
            total_trips: self.total_trips.max(0) as u64,
        }
    }
}

#[async_trait]
impl PassengerRepo for PgStore {
    async fn get_passenger(&mut self, id: &Id<Passenger>) -> Result<Passenger> {
        passenger::get(&self.pool, id).await
    }

    async fn passenger_by_phone(
        &mut self,
        phone: &str,
    ) -> Result<Option<Passenger>> {
        passenger::by_phone(&self.pool, phone).await
    }

    async fn insert_passenger(&mut self, passenger: &Passenger) -> Result<()> {
        passenger::insert(&self.pool, passenger).await
    }

    async fn add_passenger_trip(&mut self, id: &Id<Passenger>) -> Result<()> {
        passenger::add_trip(&self.pool, id).await
    }
}
