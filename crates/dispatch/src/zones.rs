use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use log::{debug, info, warn};
use model::{
    order::Order,
    zone::{HotZone, QuotaCounter},
    GeoPoint,
};
use tokio::sync::{Mutex, RwLock};
use utility::id::Id;

use crate::storage::{Database, ZoneRepo};

// Guards the step quantization against 0.09999... style float residue.
const SURGE_EPSILON: f64 = 1e-9;

/// Surge multiplier for a counter at `used` of `limit`. Below the threshold
/// the multiplier is flat 1.0; above it, it climbs in increments of `step`
/// per `step` of utilization, capped at `max`.
pub fn surge_multiplier(
    used: u32,
    limit: u32,
    threshold: f64,
    step: f64,
    max: f64,
) -> f64 {
    if limit == 0 || step <= 0.0 {
        return 1.0;
    }
    let utilization = used as f64 / limit as f64;
    if utilization < threshold {
        return 1.0;
    }
    let steps = ((utilization - threshold) / step + SURGE_EPSILON).floor();
    (1.0 + step * steps).min(max)
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    limit: u32,
    used: u32,
    /// Highest multiplier handed out this hour; keeps quotes monotonic even
    /// when a release lowers utilization again.
    peak_multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct QueuedRide {
    pub order_id: Id<Order>,
    pub enqueued_at: DateTime<Utc>,
}

struct ZoneState {
    counters: HashMap<(NaiveDate, u8), Counter>,
    queue: VecDeque<QueuedRide>,
}

pub struct ZoneRuntime {
    pub config: HotZone,
    state: Mutex<ZoneState>,
}

/// Reply of the admission check, before any ticket is taken.
#[derive(Debug, Clone)]
pub struct ZoneStatus {
    pub zone_id: Id<HotZone>,
    pub zone_name: String,
    pub used: u32,
    pub limit: u32,
    pub surge_multiplier: f64,
    pub queue_len: usize,
}

/// Outcome of trying to take a ticket for a ride originating in a zone.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Pickup is not inside any active zone.
    Outside,
    Admitted {
        zone_id: Id<HotZone>,
        zone_name: String,
        surge_multiplier: f64,
    },
    /// Quota exhausted, queue enabled, caller now waits for the sweeper.
    Queued {
        zone_id: Id<HotZone>,
        zone_name: String,
        position: usize,
    },
    /// Quota exhausted and no queue.
    Full { zone_name: String },
}

/// A queue entry that became dispatchable during a sweep.
#[derive(Debug, Clone)]
pub struct AdmittedFromQueue {
    pub order_id: Id<Order>,
    pub zone_name: String,
    pub surge_multiplier: f64,
}

pub struct ZoneEngine<D: Database> {
    database: D,
    zones: RwLock<Vec<Arc<ZoneRuntime>>>,
}

impl<D: Database> ZoneEngine<D> {
    pub fn new(database: D) -> Self {
        Self {
            database,
            zones: RwLock::new(Vec::new()),
        }
    }

    /// Loads (or re-loads) active zone configs. Counter state of zones that
    /// survive a reload is kept.
    pub async fn reload(&self) -> crate::DispatchResult<usize> {
        let configs = self.database.auto().active_zones().await?;
        let mut zones = self.zones.write().await;

        let mut next: Vec<Arc<ZoneRuntime>> = Vec::with_capacity(configs.len());
        for config in configs {
            if !config.active {
                continue;
            }
            let existing = zones
                .iter()
                .find(|zone| zone.config.id == config.id)
                .cloned();
            match existing {
                Some(zone) => next.push(zone),
                None => next.push(Arc::new(ZoneRuntime {
                    config,
                    state: Mutex::new(ZoneState {
                        counters: HashMap::new(),
                        queue: VecDeque::new(),
                    }),
                })),
            }
        }
        // Overlap winner: highest priority first, ties on lower id.
        next.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        let count = next.len();
        *zones = next;
        info!("zone engine loaded {} active zones", count);
        Ok(count)
    }

    async fn zone_for(&self, point: &GeoPoint) -> Option<Arc<ZoneRuntime>> {
        let zones = self.zones.read().await;
        zones.iter().find(|zone| zone.config.contains(point)).cloned()
    }

    pub async fn zone_by_name(&self, name: &str) -> Option<Arc<ZoneRuntime>> {
        let zones = self.zones.read().await;
        zones.iter().find(|zone| zone.config.name == name).cloned()
    }

    /// Current `(used, limit, surge, queue)` of the zone covering `point`,
    /// read consistently under the zone lock.
    pub async fn check(&self, point: &GeoPoint, now: DateTime<Utc>) -> Option<ZoneStatus> {
        let zone = self.zone_for(point).await?;
        let mut state = zone.state.lock().await;
        self.ensure_counter(&zone, &mut state, now).await;
        let counter = entry(&mut state, &zone.config, now);
        let (used, limit) = (counter.used, counter.limit);
        let surge_multiplier = quote(counter, &zone.config);
        Some(ZoneStatus {
            zone_id: zone.config.id.clone(),
            zone_name: zone.config.name.clone(),
            used,
            limit,
            surge_multiplier,
            queue_len: state.queue.len(),
        })
    }

    /// Takes one admission ticket, or queues, or refuses. The surge quoted
    /// to an admitted ride is the multiplier at this moment.
    pub async fn reserve(&self, point: &GeoPoint, now: DateTime<Utc>) -> Admission {
        let Some(zone) = self.zone_for(point).await else {
            return Admission::Outside;
        };
        let mut state = zone.state.lock().await;
        self.ensure_counter(&zone, &mut state, now).await;
        let counter = entry(&mut state, &zone.config, now);

        if counter.used < counter.limit {
            let multiplier = quote(counter, &zone.config);
            counter.used += 1;
            let snapshot = *counter;
            drop(state);
            self.persist_counter(&zone.config, now, snapshot).await;
            return Admission::Admitted {
                zone_id: zone.config.id.clone(),
                zone_name: zone.config.name.clone(),
                surge_multiplier: multiplier,
            };
        }

        if zone.config.queue_enabled
            && state.queue.len() < zone.config.max_queue_size as usize
        {
            return Admission::Queued {
                zone_id: zone.config.id.clone(),
                zone_name: zone.config.name.clone(),
                position: state.queue.len() + 1,
            };
        }

        Admission::Full {
            zone_name: zone.config.name.clone(),
        }
    }

    /// Parks an order in the zone queue after `reserve` returned `Queued`.
    pub async fn enqueue(
        &self,
        zone_name: &str,
        order_id: Id<Order>,
        now: DateTime<Utc>,
    ) {
        if let Some(zone) = self.zone_by_name(zone_name).await {
            let mut state = zone.state.lock().await;
            state.queue.push_back(QueuedRide {
                order_id,
                enqueued_at: now,
            });
        }
    }

    /// Drops a parked queue entry, e.g. when the waiting ride is cancelled.
    pub async fn remove_queued(&self, zone_name: &str, order_id: &Id<Order>) {
        if let Some(zone) = self.zone_by_name(zone_name).await {
            let mut state = zone.state.lock().await;
            state.queue.retain(|entry| entry.order_id != *order_id);
        }
    }

    /// Returns a ticket taken at `reserved_at`. Only rides cancelled before
    /// acceptance come through here.
    pub async fn release(&self, zone_name: &str, reserved_at: DateTime<Utc>) {
        let Some(zone) = self.zone_by_name(zone_name).await else {
            return;
        };
        let mut state = zone.state.lock().await;
        self.ensure_counter(&zone, &mut state, reserved_at).await;
        let key = bucket(reserved_at);
        if let Some(counter) = state.counters.get_mut(&key) {
            if counter.used == 0 {
                warn!("release for zone {} underflows counter", zone_name);
            } else {
                counter.used -= 1;
            }
            let snapshot = *counter;
            drop(state);
            self.persist_counter(&zone.config, reserved_at, snapshot).await;
        }
    }

    /// Hourly housekeeping: times out stale queue entries and admits queued
    /// rides into whatever capacity the current hour has. Surge for an
    /// admitted entry is quoted now, not at enqueue time.
    pub async fn sweep_queues(
        &self,
        now: DateTime<Utc>,
    ) -> (Vec<AdmittedFromQueue>, Vec<Id<Order>>) {
        let zones: Vec<Arc<ZoneRuntime>> =
            self.zones.read().await.iter().cloned().collect();
        let mut admitted = Vec::new();
        let mut timed_out = Vec::new();

        for zone in zones {
            let mut state = zone.state.lock().await;
            self.ensure_counter(&zone, &mut state, now).await;
            let timeout =
                chrono::Duration::minutes(zone.config.queue_timeout_minutes as i64);

            // Expire first so dead entries do not eat fresh capacity.
            while let Some(front) = state.queue.front() {
                if now - front.enqueued_at >= timeout {
                    let entry = state.queue.pop_front().unwrap();
                    timed_out.push(entry.order_id);
                } else {
                    break;
                }
            }

            loop {
                if state.queue.is_empty() {
                    break;
                }
                let counter = entry(&mut state, &zone.config, now);
                if counter.used >= counter.limit {
                    break;
                }
                let multiplier = quote(counter, &zone.config);
                counter.used += 1;
                let snapshot = *counter;
                let ride = state.queue.pop_front().unwrap();
                admitted.push(AdmittedFromQueue {
                    order_id: ride.order_id,
                    zone_name: zone.config.name.clone(),
                    surge_multiplier: multiplier,
                });
                self.persist_counter(&zone.config, now, snapshot).await;
            }
        }
        (admitted, timed_out)
    }

    /// Restores the counter of `at`'s hour from storage on first touch, so
    /// a restarted process (or a freshly loaded zone) resumes from the
    /// persisted used count instead of a reset one. The limit always comes
    /// from the current config; the hour's peak is recomputed from the
    /// restored utilization.
    async fn ensure_counter(
        &self,
        zone: &ZoneRuntime,
        state: &mut ZoneState,
        at: DateTime<Utc>,
    ) {
        let key = bucket(at);
        if state.counters.contains_key(&key) {
            return;
        }
        let (date, hour) = key;
        match self
            .database
            .auto()
            .get_quota(&zone.config.id, date, hour)
            .await
        {
            Ok(Some(row)) => {
                let limit = zone.config.effective_limit(hour);
                state.counters.insert(
                    key,
                    Counter {
                        limit,
                        used: row.used,
                        peak_multiplier: surge_multiplier(
                            row.used,
                            limit,
                            zone.config.surge_threshold,
                            zone.config.surge_step,
                            zone.config.surge_max_multiplier,
                        ),
                    },
                );
            }
            Ok(None) => {}
            Err(why) => {
                debug!(
                    "quota restore for zone {} failed: {:?}",
                    zone.config.name, why
                );
            }
        }
    }

    /// Counter writes are bookkeeping; losing one is transient and logged.
    async fn persist_counter(
        &self,
        config: &HotZone,
        at: DateTime<Utc>,
        counter: Counter,
    ) {
        let (date, hour) = bucket(at);
        let row = QuotaCounter {
            zone_id: config.id.raw(),
            date,
            hour,
            limit: counter.limit,
            used: counter.used,
        };
        if let Err(why) = self.database.auto().put_quota(&row).await {
            debug!("quota persist for zone {} failed: {:?}", config.name, why);
        }
    }
}

fn bucket(at: DateTime<Utc>) -> (NaiveDate, u8) {
    (at.date_naive(), at.hour() as u8)
}

/// Lazily creates the counter of the current hour on first access.
fn entry<'a>(
    state: &'a mut ZoneState,
    config: &HotZone,
    now: DateTime<Utc>,
) -> &'a mut Counter {
    let key = bucket(now);
    let (_, hour) = key;
    state.counters.entry(key).or_insert_with(|| Counter {
        limit: config.effective_limit(hour),
        used: 0,
        peak_multiplier: 1.0,
    })
}

/// Multiplier the next admission is quoted. Quoting ratchets the hour's
/// peak so the multiplier never falls within the hour, even after releases.
fn quote(counter: &mut Counter, config: &HotZone) -> f64 {
    let computed = surge_multiplier(
        counter.used,
        counter.limit,
        config.surge_threshold,
        config.surge_step,
        config.surge_max_multiplier,
    );
    let quoted = computed.max(counter.peak_multiplier);
    counter.peak_multiplier = quoted;
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_is_flat() {
        assert_eq!(surge_multiplier(7, 10, 0.8, 0.1, 1.5), 1.0);
    }

    #[test]
    fn at_nine_of_ten_quotes_one_point_one() {
        // threshold 0.8, step 0.1, max 1.5: u = 0.9 sits one step above.
        let m = surge_multiplier(9, 10, 0.8, 0.1, 1.5);
        assert!((m - 1.1).abs() < 1e-9, "got {}", m);
    }

    #[test]
    fn at_threshold_exactly_is_base_step() {
        let m = surge_multiplier(8, 10, 0.8, 0.1, 1.5);
        assert!((m - 1.0).abs() < 1e-9, "got {}", m);
    }

    #[test]
    fn multiplier_caps_at_max() {
        let m = surge_multiplier(100, 100, 0.5, 0.1, 1.5);
        assert!((m - 1.5).abs() < 1e-9, "got {}", m);
    }

    #[test]
    fn zero_limit_never_surges() {
        assert_eq!(surge_multiplier(0, 0, 0.8, 0.1, 1.5), 1.0);
    }
}
