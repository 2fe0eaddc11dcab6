use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use model::{
    driver::{Availability, Driver, DriverFix},
    order::Order,
    GeoPoint,
};
use tokio::sync::{Mutex, Notify, RwLock};
use utility::id::Id;

use crate::{
    storage::{Database, DriverRepo},
    transport::NearbyDriver,
    DispatchError, DispatchResult,
};

/// In-memory presence of one driver. This map is the source of truth while
/// the process runs; storage trails behind through the write-behind flusher.
#[derive(Debug, Clone)]
pub struct DriverPresence {
    pub availability: Availability,
    pub last_fix: Option<DriverFix>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_order: Option<Id<Order>>,
}

/// Snapshot row returned by availability queries.
#[derive(Debug, Clone)]
pub struct AvailableDriver {
    pub driver_id: Id<Driver>,
    pub point: GeoPoint,
    pub last_heartbeat: DateTime<Utc>,
    pub distance_m: f64,
}

pub struct PresenceRegistry {
    entries: RwLock<HashMap<Id<Driver>, DriverPresence>>,
    dirty: Mutex<HashSet<Id<Driver>>>,
    /// Woken when an availability-boundary change must reach storage before
    /// the next interval tick.
    flush_now: Notify,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            flush_now: Notify::new(),
        }
    }

    /// Opens presence for a connecting driver. A driver rejoining with an
    /// in-flight trip comes back as ON_TRIP, everyone else as AVAILABLE.
    pub async fn set_online(&self, driver_id: Id<Driver>, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(driver_id.clone())
            .or_insert_with(|| DriverPresence {
                availability: Availability::Offline,
                last_fix: None,
                last_heartbeat: now,
                current_order: None,
            });
        entry.availability = if entry.current_order.is_some() {
            Availability::OnTrip
        } else {
            Availability::Available
        };
        entry.last_heartbeat = now;
        drop(entries);
        self.mark_dirty(driver_id, true).await;
    }

    pub async fn set_status(
        &self,
        driver_id: &Id<Driver>,
        availability: Availability,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(driver_id)
            .ok_or(DispatchError::NotFound("driver presence"))?;

        // A driver holding a non-terminal order must not become AVAILABLE.
        if availability == Availability::Available && entry.current_order.is_some()
        {
            warn!(
                "refusing AVAILABLE for driver {} holding order {:?}",
                driver_id, entry.current_order
            );
            return Err(DispatchError::Fatal(format!(
                "driver {} still holds an order",
                driver_id
            )));
        }

        let was_available = entry.availability == Availability::Available;
        entry.availability = availability;
        entry.last_heartbeat = now;
        let is_available = availability == Availability::Available;
        drop(entries);

        // Dispatch depends on AVAILABLE being visible; flush those at once.
        self.mark_dirty(driver_id.clone(), was_available != is_available)
            .await;
        Ok(())
    }

    /// Location ticks are accepted at any status; only AVAILABLE drivers
    /// become passenger-visible through queries.
    pub async fn update_location(
        &self,
        driver_id: Id<Driver>,
        point: GeoPoint,
        speed: Option<f64>,
        bearing: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(driver_id.clone())
            .or_insert_with(|| DriverPresence {
                availability: Availability::Offline,
                last_fix: None,
                last_heartbeat: now,
                current_order: None,
            });
        entry.last_fix = Some(DriverFix {
            point,
            speed,
            bearing,
            recorded_at: now,
        });
        entry.last_heartbeat = now;
        drop(entries);
        self.mark_dirty(driver_id, false).await;
    }

    /// Session loss. An AVAILABLE driver drops to OFFLINE; a driver with an
    /// assignment keeps it and stays ON_TRIP for when they reconnect.
    pub async fn on_disconnect(&self, driver_id: &Id<Driver>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(driver_id) {
            if entry.availability == Availability::Available {
                entry.availability = Availability::Offline;
            }
        }
        drop(entries);
        self.mark_dirty(driver_id.clone(), true).await;
    }

    /// Serialized with the owning order transition by the orchestrator's
    /// per-order critical section.
    pub async fn assign_order(&self, driver_id: &Id<Driver>, order_id: Id<Order>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(driver_id) {
            entry.current_order = Some(order_id);
            entry.availability = Availability::OnTrip;
        }
        drop(entries);
        self.mark_dirty(driver_id.clone(), true).await;
    }

    /// Clears an assignment; `back_to_available` is false when the driver
    /// went off-shift or was blocked meanwhile.
    pub async fn clear_order(&self, driver_id: &Id<Driver>, back_to_available: bool) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(driver_id) {
            entry.current_order = None;
            if back_to_available && entry.availability == Availability::OnTrip {
                entry.availability = Availability::Available;
            }
        }
        drop(entries);
        self.mark_dirty(driver_id.clone(), true).await;
    }

    pub async fn get(&self, driver_id: &Id<Driver>) -> Option<DriverPresence> {
        self.entries.read().await.get(driver_id).cloned()
    }

    pub async fn current_order(&self, driver_id: &Id<Driver>) -> Option<Id<Order>> {
        self.entries
            .read()
            .await
            .get(driver_id)
            .and_then(|entry| entry.current_order.clone())
    }

    /// Heartbeat freshness check; stale drivers count as offline for
    /// selection no matter what their stored availability claims.
    fn fresh(heartbeat: DateTime<Utc>, now: DateTime<Utc>, freshness: Duration) -> bool {
        now - heartbeat <= freshness
    }

    /// Snapshot of dispatchable drivers within `radius_m` of `center`.
    pub async fn query_available(
        &self,
        center: GeoPoint,
        radius_m: f64,
        now: DateTime<Utc>,
        freshness: Duration,
    ) -> Vec<AvailableDriver> {
        let entries = self.entries.read().await;
        let mut result = Vec::new();
        for (driver_id, entry) in entries.iter() {
            if entry.availability != Availability::Available
                || entry.current_order.is_some()
                || !Self::fresh(entry.last_heartbeat, now, freshness)
            {
                continue;
            }
            let Some(fix) = entry.last_fix else { continue };
            let distance_m = center.distance_m(&fix.point);
            if distance_m <= radius_m {
                result.push(AvailableDriver {
                    driver_id: driver_id.clone(),
                    point: fix.point,
                    last_heartbeat: entry.last_heartbeat,
                    distance_m,
                });
            }
        }
        result
    }

    /// The passenger-visible nearby set: AVAILABLE and fresh, no radius cut.
    pub async fn nearby_snapshot(
        &self,
        now: DateTime<Utc>,
        freshness: Duration,
    ) -> Vec<NearbyDriver> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, entry)| {
                entry.availability == Availability::Available
                    && entry.current_order.is_none()
                    && Self::fresh(entry.last_heartbeat, now, freshness)
            })
            .filter_map(|(driver_id, entry)| {
                entry.last_fix.map(|fix| NearbyDriver {
                    driver_id: driver_id.clone(),
                    latitude: fix.point.latitude,
                    longitude: fix.point.longitude,
                    timestamp: fix.recorded_at,
                })
            })
            .collect()
    }

    async fn mark_dirty(&self, driver_id: Id<Driver>, flush_immediately: bool) {
        self.dirty.lock().await.insert(driver_id);
        if flush_immediately {
            self.flush_now.notify_one();
        }
    }

    /// Drains the dirty set and writes one coalesced row per driver.
    pub async fn flush_once<D: Database>(&self, database: &D) {
        let drained: Vec<Id<Driver>> = {
            let mut dirty = self.dirty.lock().await;
            dirty.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        let entries = self.entries.read().await;
        let mut handle = database.auto();
        for driver_id in drained {
            let Some(entry) = entries.get(&driver_id) else {
                continue;
            };
            if let Err(why) = handle
                .update_driver_presence(
                    &driver_id,
                    entry.availability,
                    entry.last_fix,
                    entry.last_heartbeat,
                )
                .await
            {
                // Write-behind loss is transient; the row stays dirty.
                debug!("presence flush for {} failed: {:?}", driver_id, why);
                self.dirty.lock().await.insert(driver_id);
            }
        }
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-behind loop: one coalesced write per driver per interval, plus an
/// immediate pass whenever an AVAILABLE-boundary change is flagged.
pub async fn run_presence_flusher<D: Database>(
    registry: Arc<PresenceRegistry>,
    database: D,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = registry.flush_now.notified() => {}
        }
        registry.flush_once(&database).await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn drv(n: u32) -> Id<Driver> {
        Id::new(format!("drv_{}", n))
    }

    #[tokio::test]
    async fn stale_heartbeat_excludes_driver_from_queries() {
        let registry = PresenceRegistry::new();
        registry.set_online(drv(1), t0()).await;
        registry
            .update_location(drv(1), GeoPoint::new(23.993, 121.601), None, None, t0())
            .await;

        let now = t0() + Duration::minutes(6);
        let found = registry
            .query_available(
                GeoPoint::new(23.993, 121.601),
                5_000.0,
                now,
                Duration::minutes(5),
            )
            .await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_at_exact_freshness_boundary_still_counts() {
        let registry = PresenceRegistry::new();
        registry.set_online(drv(1), t0()).await;
        registry
            .update_location(drv(1), GeoPoint::new(23.993, 121.601), None, None, t0())
            .await;

        let now = t0() + Duration::minutes(5);
        let found = registry
            .query_available(
                GeoPoint::new(23.993, 121.601),
                5_000.0,
                now,
                Duration::minutes(5),
            )
            .await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn available_with_open_order_is_refused() {
        let registry = PresenceRegistry::new();
        registry.set_online(drv(1), t0()).await;
        registry
            .assign_order(&drv(1), Id::new("ord_1".to_owned()))
            .await;

        let result = registry
            .set_status(&drv(1), Availability::Available, t0())
            .await;
        assert!(result.is_err());
        let entry = registry.get(&drv(1)).await.unwrap();
        assert_eq!(entry.availability, Availability::OnTrip);
    }

    #[tokio::test]
    async fn location_while_offline_is_kept_but_not_visible() {
        let registry = PresenceRegistry::new();
        registry
            .update_location(drv(1), GeoPoint::new(23.993, 121.601), None, None, t0())
            .await;

        let entry = registry.get(&drv(1)).await.unwrap();
        assert!(entry.last_fix.is_some());
        assert_eq!(entry.availability, Availability::Offline);

        let nearby = registry.nearby_snapshot(t0(), Duration::minutes(5)).await;
        assert!(nearby.is_empty());
    }

    #[tokio::test]
    async fn reconnect_during_trip_restores_on_trip() {
        let registry = PresenceRegistry::new();
        registry.set_online(drv(1), t0()).await;
        registry
            .assign_order(&drv(1), Id::new("ord_1".to_owned()))
            .await;
        registry.on_disconnect(&drv(1)).await;
        registry.set_online(drv(1), t0()).await;

        let entry = registry.get(&drv(1)).await.unwrap();
        assert_eq!(entry.availability, Availability::OnTrip);
    }
}
