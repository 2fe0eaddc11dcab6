use std::{
    collections::HashMap,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use model::{
    driver::{Availability, Driver},
    order::{Order, OrderStatus},
    passenger::Passenger,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use utility::id::{HasId, Id};

/// Events pushed to a connected driver. Names on the wire are normative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DriverEvent {
    #[serde(rename = "order:offer", rename_all = "camelCase")]
    OrderOffer {
        order: Order,
        wave_number: u32,
        wave_deadline: DateTime<Utc>,
        estimated_fare: f64,
        surge_multiplier: f64,
        #[serde(rename = "predictedEta")]
        predicted_eta_s: f64,
        auto_accept_score: f64,
    },
    #[serde(rename = "order:cancelled", rename_all = "camelCase")]
    OrderCancelled {
        order_id: Id<Order>,
        reason: String,
    },
    #[serde(rename = "order:update", rename_all = "camelCase")]
    OrderUpdate {
        order_id: Id<Order>,
        status: OrderStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

/// One row of the nearby-driver snapshot sent to passengers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyDriver {
    pub driver_id: Id<Driver>,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Events pushed to a connected passenger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PassengerEvent {
    #[serde(rename = "nearby:drivers")]
    NearbyDrivers(Vec<NearbyDriver>),
    #[serde(rename = "order:update", rename_all = "camelCase")]
    OrderUpdate { order: Order },
    #[serde(rename = "order:no_driver", rename_all = "camelCase")]
    NoDriver { order_id: Id<Order> },
    #[serde(rename = "driver:location", rename_all = "camelCase")]
    DriverLocation {
        order_id: Id<Order>,
        latitude: f64,
        longitude: f64,
    },
}

/// Messages a driver client sends over its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DriverClientMessage {
    #[serde(rename = "driver:online", rename_all = "camelCase")]
    Online { driver_id: Id<Driver> },
    #[serde(rename = "driver:status", rename_all = "camelCase")]
    Status {
        driver_id: Id<Driver>,
        status: Availability,
    },
    #[serde(rename = "driver:location", rename_all = "camelCase")]
    Location {
        driver_id: Id<Driver>,
        lat: f64,
        lng: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bearing: Option<f64>,
    },
}

/// Messages a passenger client sends over its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PassengerClientMessage {
    #[serde(rename = "passenger:online", rename_all = "camelCase")]
    Online { passenger_id: Id<Passenger> },
}

/// Identifies one physical connection; a reconnect gets a new value so a
/// late disconnect of the old socket cannot drop the new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

const SESSION_BUFFER: usize = 32;

struct Session<E> {
    connection: ConnectionId,
    tx: mpsc::Sender<E>,
}

/// Registry from id to a push channel: register / deliver / drop. Delivery
/// is at-most-once per connection and reports loss through its return value;
/// upstream uses that flag for bookkeeping only.
pub struct PushRegistry<T, E>
where
    T: HasId,
    T::IdType: Clone + Eq + Hash,
{
    next_connection: AtomicU64,
    sessions: RwLock<HashMap<Id<T>, Session<E>>>,
}

impl<T, E> PushRegistry<T, E>
where
    T: HasId,
    T::IdType: Clone + Eq + Hash + Send + Sync,
    E: Send,
{
    pub fn new() -> Self {
        Self {
            next_connection: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a session for `id`, replacing any previous one. The returned
    /// receiver is the peer's event stream.
    pub async fn register(&self, id: Id<T>) -> (ConnectionId, mpsc::Receiver<E>) {
        let connection =
            ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.sessions
            .write()
            .await
            .insert(id, Session { connection, tx });
        (connection, rx)
    }

    /// Closes the session for `id`, but only if it still belongs to
    /// `connection`.
    pub async fn drop_connection(&self, id: &Id<T>, connection: ConnectionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            if session.connection == connection {
                sessions.remove(id);
            }
        }
    }

    /// Pushes an event; `false` means the peer is not connected (or went
    /// away between lookup and send).
    pub async fn deliver(&self, id: &Id<T>, event: E) -> bool {
        let tx = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(session) => session.tx.clone(),
                None => return false,
            }
        };
        // Send outside the lock: a full buffer may suspend.
        tx.send(event).await.is_ok()
    }

    pub async fn is_connected(&self, id: &Id<T>) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn connected_ids(&self) -> Vec<Id<T>> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

impl<T, E> PushRegistry<T, E>
where
    T: HasId,
    T::IdType: Clone + Eq + Hash + Send + Sync,
    E: Send + Clone,
{
    /// Best-effort fan-out; returns how many peers the event reached.
    pub async fn broadcast(&self, event: E) -> usize {
        let targets: Vec<mpsc::Sender<E>> = {
            let sessions = self.sessions.read().await;
            sessions.values().map(|s| s.tx.clone()).collect()
        };
        let mut delivered = 0;
        for tx in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl<T, E> Default for PushRegistry<T, E>
where
    T: HasId,
    T::IdType: Clone + Eq + Hash + Send + Sync,
    E: Send,
{
    fn default() -> Self {
        Self::new()
    }
}

pub type DriverGateway = PushRegistry<Driver, DriverEvent>;
pub type PassengerGateway = PushRegistry<Passenger, PassengerEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_to_unknown_peer_reports_loss() {
        let registry: PushRegistry<Driver, DriverEvent> = PushRegistry::new();
        let delivered = registry
            .deliver(
                &Id::new("drv_x".to_owned()),
                DriverEvent::OrderCancelled {
                    order_id: Id::new("ord_x".to_owned()),
                    reason: "taken".to_owned(),
                },
            )
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn reconnect_replaces_session_and_old_drop_is_ignored() {
        let registry: PushRegistry<Driver, DriverEvent> = PushRegistry::new();
        let id: Id<Driver> = Id::new("drv_1".to_owned());

        let (old_connection, _old_rx) = registry.register(id.clone()).await;
        let (_new_connection, mut new_rx) = registry.register(id.clone()).await;

        // Dropping the stale connection must not tear down the new session.
        registry.drop_connection(&id, old_connection).await;
        assert!(registry.is_connected(&id).await);

        let delivered = registry
            .deliver(
                &id,
                DriverEvent::OrderCancelled {
                    order_id: Id::new("ord_1".to_owned()),
                    reason: "taken".to_owned(),
                },
            )
            .await;
        assert!(delivered);
        assert!(new_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn deliver_after_receiver_dropped_reports_loss() {
        let registry: PushRegistry<Driver, DriverEvent> = PushRegistry::new();
        let id: Id<Driver> = Id::new("drv_1".to_owned());
        let (_connection, rx) = registry.register(id.clone()).await;
        drop(rx);
        let delivered = registry
            .deliver(
                &id,
                DriverEvent::OrderCancelled {
                    order_id: Id::new("ord_1".to_owned()),
                    reason: "taken".to_owned(),
                },
            )
            .await;
        assert!(!delivered);
    }

    #[test]
    fn events_use_normative_wire_names() {
        let event = PassengerEvent::NoDriver {
            order_id: Id::new("ord_9".to_owned()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "order:no_driver");
        assert_eq!(json["data"]["orderId"], "ord_9");
    }
}
