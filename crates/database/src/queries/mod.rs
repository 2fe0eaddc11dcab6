use dispatch::storage::StorageError;

pub mod dispatch_log;
pub mod driver;
pub mod eta;
pub mod order;
pub mod passenger;
pub mod pattern;
pub mod rating;
pub mod rejection;
pub mod stats;
pub mod zone;

pub fn convert_error(why: sqlx::Error) -> StorageError {
    match why {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        other => StorageError::Other(Box::new(other)),
    }
}
