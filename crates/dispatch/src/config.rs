use std::time::Duration;

use chrono::Duration as ChronoDuration;
use model::GeoPoint;
use serde::{Deserialize, Serialize};

/// Circular service area; requests with a pickup outside it are refused
/// before any zone or candidate work happens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceArea {
    pub center: GeoPoint,
    pub radius_m: f64,
}

impl ServiceArea {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        self.center.distance_m(point) <= self.radius_m
    }
}

/// Fare table for the quote shown with an offer. The final amount always
/// comes from the driver's meter at trip end.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareConfig {
    pub base_fare: f64,
    pub per_km_rate: f64,
}

impl FareConfig {
    pub fn estimate(&self, distance_m: f64, surge_multiplier: f64) -> f64 {
        (self.base_fare + distance_m / 1000.0 * self.per_km_rate)
            * surge_multiplier
    }
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: 85.0,
            per_km_rate: 25.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum heartbeat age before a driver counts as offline for
    /// selection, regardless of stored availability.
    pub presence_freshness: ChronoDuration,
    /// Candidates per wave.
    pub wave_size: usize,
    pub wave_timeout: Duration,
    pub max_waves: u32,
    /// Search radius of wave 1; doubles per wave up to the cap.
    pub candidate_radius_m: f64,
    pub candidate_radius_max_m: f64,
    /// Write-behind flush cadence of the presence registry.
    pub batch_interval: Duration,
    pub eta_cache_ttl: ChronoDuration,
    /// Grid size of the ETA cache key, in degrees.
    pub eta_quantization_deg: f64,
    /// Rejection probability assumed when a driver has no pattern data.
    pub predictor_prior: f64,
    /// Probability penalty once a driver is past their earnings threshold.
    pub earnings_penalty: f64,
    pub stale_ride_sweep_interval: Duration,
    /// Cadence of the nearby-driver broadcast to connected passengers.
    pub nearby_announce_interval: Duration,
    /// Degraded mode: offer to every fresh AVAILABLE driver in one wave
    /// instead of running the ranked pipeline.
    pub broadcast_fallback: bool,
    /// Average speed assumed when the routing provider is unavailable.
    pub fallback_speed_kmh: f64,
    pub service_area: ServiceArea,
    pub fare: FareConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            presence_freshness: ChronoDuration::minutes(5),
            wave_size: 3,
            wave_timeout: Duration::from_secs(20),
            max_waves: 3,
            candidate_radius_m: 5_000.0,
            candidate_radius_max_m: 15_000.0,
            batch_interval: Duration::from_secs(5),
            eta_cache_ttl: ChronoDuration::hours(1),
            eta_quantization_deg: 1e-4,
            predictor_prior: 0.2,
            earnings_penalty: 0.15,
            stale_ride_sweep_interval: Duration::from_secs(30),
            nearby_announce_interval: Duration::from_secs(10),
            broadcast_fallback: false,
            fallback_speed_kmh: 40.0,
            service_area: ServiceArea {
                center: GeoPoint::new(23.99, 121.6),
                radius_m: 30_000.0,
            },
            fare: FareConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Search radius for a given wave number (1-based).
    pub fn radius_for_wave(&self, wave_number: u32) -> f64 {
        let doubled = self.candidate_radius_m
            * f64::powi(2.0, wave_number.saturating_sub(1) as i32);
        doubled.min(self.candidate_radius_max_m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_doubles_and_caps() {
        let config = DispatchConfig::default();
        assert_eq!(config.radius_for_wave(1), 5_000.0);
        assert_eq!(config.radius_for_wave(2), 10_000.0);
        assert_eq!(config.radius_for_wave(3), 15_000.0);
        assert_eq!(config.radius_for_wave(4), 15_000.0);
    }

    #[test]
    fn fare_estimate_applies_surge() {
        let fare = FareConfig {
            base_fare: 85.0,
            per_km_rate: 25.0,
        };
        let quote = fare.estimate(2_000.0, 1.1);
        assert!((quote - (85.0 + 50.0) * 1.1).abs() < 1e-9);
    }
}
