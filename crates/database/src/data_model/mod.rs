pub mod dispatch_log;
pub mod driver;
pub mod eta;
pub mod order;
pub mod passenger;
pub mod pattern;
pub mod rating;
pub mod rejection;
pub mod zone;

pub use dispatch_log::DispatchLogRow;
pub use driver::DriverRow;
pub use eta::EtaRow;
pub use order::OrderRow;
pub use passenger::PassengerRow;
pub use pattern::PatternRow;
pub use rating::RatingRow;
pub use rejection::RejectionRow;
pub use zone::{QuotaRow, ZoneRow};

/// Parses a TEXT-encoded JSON column, falling back to the given default
/// when the column is empty or unreadable.
pub(crate) fn from_json_text<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    fallback: T,
) -> T {
    match raw {
        Some(raw) if !raw.is_empty() => {
            serde_json::from_str(&raw).unwrap_or(fallback)
        }
        _ => fallback,
    }
}

pub(crate) fn to_json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned())
}
