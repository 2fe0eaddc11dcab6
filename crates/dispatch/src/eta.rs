use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use log::debug;
use model::{
    eta::{EtaEntry, EtaKey},
    GeoPoint,
};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::storage::{Database, EtaRepo};

#[derive(Debug, Clone, Copy)]
pub struct RouteEstimate {
    pub distance_m: f64,
    pub duration_s: f64,
    pub duration_in_traffic_s: f64,
}

#[derive(Debug)]
pub struct ProviderError(pub String);

/// External routing provider consulted on cache misses. Optional; without
/// one (or when it fails) the cache falls back to great-circle distance at
/// a configured average speed.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> Result<RouteEstimate, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    routes: Vec<OsrmRoute>,
}

/// OSRM-compatible HTTP routing backend.
pub struct HttpRouteProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRouteProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RouteProvider for HttpRouteProvider {
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> Result<RouteEstimate, ProviderError> {
        let url = format!(
            "{}/route/v1/driving/{},{};{},{}?overview=false",
            self.base_url,
            origin.longitude,
            origin.latitude,
            destination.longitude,
            destination.latitude,
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|why| ProviderError(why.to_string()))?
            .error_for_status()
            .map_err(|why| ProviderError(why.to_string()))?;
        let body: OsrmResponse = response
            .json()
            .await
            .map_err(|why| ProviderError(why.to_string()))?;
        let route = body
            .routes
            .first()
            .ok_or_else(|| ProviderError("no route returned".to_owned()))?;
        Ok(RouteEstimate {
            distance_m: route.distance,
            duration_s: route.duration,
            duration_in_traffic_s: route.duration,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EtaLookup {
    pub distance_m: f64,
    pub duration_s: f64,
    pub from_cache: bool,
}

pub struct EtaCache<D: Database> {
    database: D,
    provider: Option<Arc<dyn RouteProvider>>,
    entries: RwLock<HashMap<EtaKey, EtaEntry>>,
    ttl: chrono::Duration,
    quantization_deg: f64,
    fallback_speed_kmh: f64,
}

impl<D: Database> EtaCache<D> {
    pub fn new(
        database: D,
        provider: Option<Arc<dyn RouteProvider>>,
        ttl: chrono::Duration,
        quantization_deg: f64,
        fallback_speed_kmh: f64,
    ) -> Self {
        Self {
            database,
            provider,
            entries: RwLock::new(HashMap::new()),
            ttl,
            quantization_deg,
            fallback_speed_kmh,
        }
    }

    /// Distance and duration from origin to destination at the hour of
    /// `now`. Never fails: a missing provider degrades to great-circle.
    pub async fn lookup(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
        now: DateTime<Utc>,
    ) -> EtaLookup {
        let key = EtaKey::quantized(
            &origin,
            &destination,
            now.hour() as u8,
            self.quantization_deg,
        );

        // Expired entries are treated as absent everywhere.
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(&key) {
                if !entry.expired(now) {
                    entry.hits += 1;
                    return EtaLookup {
                        distance_m: entry.distance_m,
                        duration_s: entry.duration_s,
                        from_cache: true,
                    };
                }
                entries.remove(&key);
            }
        }

        if let Ok(Some(entry)) = self.database.auto().get_eta(&key).await {
            if !entry.expired(now) {
                self.entries.write().await.insert(key, entry);
                return EtaLookup {
                    distance_m: entry.distance_m,
                    duration_s: entry.duration_s,
                    from_cache: true,
                };
            }
        }

        if let Some(provider) = &self.provider {
            match provider.route(origin, destination).await {
                Ok(estimate) => {
                    let entry = EtaEntry {
                        distance_m: estimate.distance_m,
                        duration_s: estimate.duration_s,
                        duration_in_traffic_s: estimate.duration_in_traffic_s,
                        cached_at: now,
                        expires_at: now + self.ttl,
                        hits: 0,
                    };
                    self.entries.write().await.insert(key, entry);
                    if let Err(why) =
                        self.database.auto().put_eta(&key, &entry).await
                    {
                        debug!("eta persist failed: {:?}", why);
                    }
                    return EtaLookup {
                        distance_m: estimate.distance_m,
                        duration_s: estimate.duration_s,
                        from_cache: false,
                    };
                }
                Err(why) => {
                    debug!("route provider failed, falling back: {}", why.0);
                }
            }
        }

        // Provider unavailable: great-circle at the assumed average speed.
        // Deliberately not cached, so a recovered provider takes over.
        let distance_m = origin.distance_m(&destination);
        let duration_s = distance_m / (self.fallback_speed_kmh / 3.6).max(1e-6);
        EtaLookup {
            distance_m,
            duration_s,
            from_cache: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::test_support::MemoryDatabase;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    struct FixedProvider {
        estimate: RouteEstimate,
    }

    #[async_trait]
    impl RouteProvider for FixedProvider {
        async fn route(
            &self,
            _origin: GeoPoint,
            _destination: GeoPoint,
        ) -> Result<RouteEstimate, ProviderError> {
            Ok(self.estimate)
        }
    }

    fn cache_with(
        database: MemoryDatabase,
        provider: Option<Arc<dyn RouteProvider>>,
    ) -> EtaCache<MemoryDatabase> {
        EtaCache::new(database, provider, chrono::Duration::hours(1), 1e-4, 40.0)
    }

    #[tokio::test]
    async fn fallback_uses_great_circle_and_average_speed() {
        let cache = cache_with(MemoryDatabase::new(), None);
        let origin = GeoPoint::new(23.993, 121.601);
        let destination = GeoPoint::new(23.987, 121.606);

        let lookup = cache.lookup(origin, destination, t0()).await;
        let expected_m = origin.distance_m(&destination);
        assert!((lookup.distance_m - expected_m).abs() < 1.0);
        // 40 km/h is 11.1 m/s.
        assert!((lookup.duration_s - expected_m / (40.0 / 3.6)).abs() < 1.0);
        assert!(!lookup.from_cache);
    }

    #[tokio::test]
    async fn provider_result_is_cached_until_expiry() {
        let provider = Arc::new(FixedProvider {
            estimate: RouteEstimate {
                distance_m: 1200.0,
                duration_s: 180.0,
                duration_in_traffic_s: 210.0,
            },
        });
        let cache = cache_with(MemoryDatabase::new(), Some(provider));
        let origin = GeoPoint::new(23.993, 121.601);
        let destination = GeoPoint::new(23.987, 121.606);

        let first = cache.lookup(origin, destination, t0()).await;
        assert!(!first.from_cache);

        let second = cache
            .lookup(origin, destination, t0() + chrono::Duration::minutes(10))
            .await;
        assert!(second.from_cache);
        assert_eq!(second.distance_m, 1200.0);

        // Past the TTL and into the same clock hour of the next day, the
        // entry counts as absent again.
        let after = cache
            .lookup(origin, destination, t0() + chrono::Duration::hours(24))
            .await;
        assert!(!after.from_cache);
    }

    #[tokio::test]
    async fn nearby_origins_share_an_entry() {
        let provider = Arc::new(FixedProvider {
            estimate: RouteEstimate {
                distance_m: 900.0,
                duration_s: 120.0,
                duration_in_traffic_s: 120.0,
            },
        });
        let cache = cache_with(MemoryDatabase::new(), Some(provider));
        let destination = GeoPoint::new(23.987, 121.606);

        cache
            .lookup(GeoPoint::new(23.99300, 121.60100), destination, t0())
            .await;
        // ~3 m away: same quantized cell.
        let hit = cache
            .lookup(GeoPoint::new(23.99302, 121.60101), destination, t0())
            .await;
        assert!(hit.from_cache);
    }
}
