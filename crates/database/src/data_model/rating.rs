use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::storage::{RatingRepo, Result};
use model::rating::Rating;
use sqlx::prelude::FromRow;
use utility::id::Id;

use crate::{queries::rating, PgStore};

#[derive(Debug, Clone, FromRow)]
pub struct RatingRow {
    pub id: String,
    pub order_id: String,
    pub passenger_id: String,
    pub driver_id: String,
    pub stars: i16,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RatingRow {
    pub fn to_model(self) -> Rating {
        Rating {
            id: Id::new(self.id),
            order_id: Id::new(self.order_id),
            passenger_id: Id::new(self.passenger_id),
            driver_id: Id::new(self.driver_id),
            stars: self.stars.clamp(1, 5) as u8,
            comment: self.comment,
            created_at: self.created_at,
        }
    }
}

#[async_trait]
impl RatingRepo for PgStore {
    async fn append_rating(&mut self, rating: &Rating) -> Result<()> {
        rating::append(&self.pool, rating).await
    }
}
