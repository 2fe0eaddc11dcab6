use std::{env, error::Error};

use dispatch::storage::{Database, DatabaseOperations};

pub mod data_model;
pub mod queries;

pub struct DatabaseConnectionInfo {
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub port: u16,
    pub database: String,
}

impl DatabaseConnectionInfo {
    pub fn from_env() -> Option<Self> {
        let username = env::var("DATABASE_USER").ok()?;
        let password = env::var("DATABASE_PASSWORD").ok()?;
        let hostname = env::var("DATABASE_HOST").ok()?;
        let port: u16 = env::var("DATABASE_PORT").ok()?.parse().ok()?;
        let database = env::var("DATABASE_NAME").ok()?;
        Some(Self {
            username,
            password,
            hostname,
            port,
            database,
        })
    }

    pub(self) fn postgres_url(self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.hostname, self.port, self.database
        )
    }
}

#[derive(Clone)]
pub struct PgDatabase {
    connection: sqlx::PgPool,
}

impl PgDatabase {
    pub async fn connect(
        connection_info: DatabaseConnectionInfo,
    ) -> Result<Self, Box<dyn Error>> {
        let url = connection_info.postgres_url();
        let pool = sqlx::postgres::PgPool::connect(&url).await?;
        Ok(Self { connection: pool })
    }
}

/// Autocommit handle; every operation is a single statement, so the
/// optimistic status guards carry the atomicity.
pub struct PgStore {
    pub(crate) pool: sqlx::PgPool,
}

impl DatabaseOperations for PgStore {}

impl Database for PgDatabase {
    type Handle = PgStore;

    fn auto(&self) -> Self::Handle {
        PgStore {
            pool: self.connection.clone(),
        }
    }
}
