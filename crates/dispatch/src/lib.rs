use std::{error, fmt, result};

use model::order::OrderStatus;

pub mod config;
pub mod eta;
pub mod lifecycle;
pub mod orchestrator;
pub mod predictor;
pub mod presence;
pub mod scoring;
pub mod storage;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;
pub mod transport;
pub mod zones;

pub use config::DispatchConfig;
pub use orchestrator::Dispatcher;

/// Coarse classification of a failure, driving both the HTTP status mapping
/// and the recover-or-bubble decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Policy,
    State,
    Exhaustion,
    Transient,
    Fatal,
}

#[derive(Debug)]
pub enum DispatchError {
    /// Missing fields, out-of-range coordinates, unknown enum values.
    Validation(String),
    PassengerBlocked,
    DriverBlocked,
    /// The caller is not the assignee of the order they try to act on.
    NotAssignee,
    /// The driver already holds a non-terminal order.
    DriverBusy,
    /// Zone quota exhausted and the zone has no overflow queue.
    ZoneFull { zone: String },
    BadTransition {
        from: OrderStatus,
        to: OrderStatus,
    },
    AlreadyTaken,
    /// Offer response arrived after the wave ended.
    Stale,
    /// All waves exhausted without an acceptance.
    NoDriver,
    QueueTimeout,
    NotFound(&'static str),
    Storage(storage::StorageError),
    /// Invariant violations, clock regressions, storage past the retry
    /// ceiling. Never masked.
    Fatal(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) => ErrorKind::Validation,
            DispatchError::PassengerBlocked
            | DispatchError::DriverBlocked
            | DispatchError::NotAssignee
            | DispatchError::DriverBusy
            | DispatchError::ZoneFull { .. } => ErrorKind::Policy,
            DispatchError::BadTransition { .. }
            | DispatchError::AlreadyTaken
            | DispatchError::Stale => ErrorKind::State,
            DispatchError::NoDriver | DispatchError::QueueTimeout => {
                ErrorKind::Exhaustion
            }
            DispatchError::NotFound(_) => ErrorKind::Validation,
            DispatchError::Storage(_) => ErrorKind::Transient,
            DispatchError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "MISSING_FIELDS",
            DispatchError::PassengerBlocked => "PASSENGER_BLOCKED",
            DispatchError::DriverBlocked => "DRIVER_BLOCKED",
            DispatchError::NotAssignee => "NOT_ASSIGNEE",
            DispatchError::DriverBusy => "DRIVER_BUSY",
            DispatchError::ZoneFull { .. } => "ZONE_FULL",
            DispatchError::BadTransition { .. } => "BAD_TRANSITION",
            DispatchError::AlreadyTaken => "ALREADY_TAKEN",
            DispatchError::Stale => "STALE",
            DispatchError::NoDriver => "NO_DRIVER",
            DispatchError::QueueTimeout => "QUEUE_TIMEOUT",
            DispatchError::NotFound(_) => "NOT_FOUND",
            DispatchError::Storage(_) => "STORAGE_ERROR",
            DispatchError::Fatal(_) => "INTERNAL",
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Validation(why) => write!(f, "validation: {}", why),
            DispatchError::PassengerBlocked => write!(f, "passenger is blocked"),
            DispatchError::DriverBlocked => write!(f, "driver is blocked"),
            DispatchError::NotAssignee => {
                write!(f, "caller is not the assigned driver")
            }
            DispatchError::DriverBusy => {
                write!(f, "driver already has an open order")
            }
            DispatchError::ZoneFull { zone } => {
                write!(f, "zone {} is at capacity", zone)
            }
            DispatchError::BadTransition { from, to } => {
                write!(f, "illegal transition {} -> {}", from, to)
            }
            DispatchError::AlreadyTaken => write!(f, "order already taken"),
            DispatchError::Stale => write!(f, "offer no longer valid"),
            DispatchError::NoDriver => write!(f, "no driver accepted"),
            DispatchError::QueueTimeout => write!(f, "zone queue timed out"),
            DispatchError::NotFound(what) => write!(f, "{} not found", what),
            DispatchError::Storage(why) => write!(f, "storage: {:?}", why),
            DispatchError::Fatal(why) => write!(f, "fatal: {}", why),
        }
    }
}

impl error::Error for DispatchError {}

impl From<storage::StorageError> for DispatchError {
    fn from(value: storage::StorageError) -> Self {
        match value {
            storage::StorageError::NotFound => DispatchError::NotFound("record"),
            other => DispatchError::Storage(other),
        }
    }
}

pub type DispatchResult<T> = result::Result<T, DispatchError>;
