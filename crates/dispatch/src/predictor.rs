use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;
use model::{
    driver::{DayStats, Driver, OfferFilters},
    pattern::DriverPattern,
};
use tokio::sync::RwLock;
use utility::id::Id;

use crate::storage::{Database, PatternRepo};

/// Trip-length buckets of the pattern table, in meters.
const SHORT_TRIP_M: f64 = 3_000.0;
const LONG_TRIP_M: f64 = 10_000.0;

/// Everything the model knows about one offer to one driver.
#[derive(Debug, Clone)]
pub struct OfferFeatures {
    pub pickup_distance_m: f64,
    pub trip_distance_m: Option<f64>,
    pub estimated_fare: f64,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub zone_name: Option<String>,
    pub today: DayStats,
}

fn bucket_rate(pattern: &DriverPattern, trip_distance_m: f64) -> f64 {
    if trip_distance_m < SHORT_TRIP_M {
        pattern.bucket_rates.short
    } else if trip_distance_m < LONG_TRIP_M {
        pattern.bucket_rates.medium
    } else {
        pattern.bucket_rates.long
    }
}

/// Probability in [0,1] that the driver turns this offer down. A
/// deterministic piecewise function over the driver's pattern snapshot.
pub fn rejection_probability(
    pattern: &DriverPattern,
    features: &OfferFeatures,
    prior: f64,
    earnings_penalty: f64,
) -> f64 {
    let mut probability = match pattern.hourly_acceptance.get(&features.hour_of_day)
    {
        Some(rate) => 1.0 - rate,
        None => prior,
    };

    // Longer-than-usual pickups push the probability up, scaled by the
    // longest pickup the driver has ever accepted.
    probability += (features.pickup_distance_m - pattern.avg_accepted_pickup_m)
        .max(0.0)
        / pattern.max_accepted_pickup_m.max(1.0);

    if let Some(trip_distance_m) = features.trip_distance_m {
        probability += 0.5 - bucket_rate(pattern, trip_distance_m);
    }

    if features.today.earnings > pattern.earnings_threshold {
        probability += earnings_penalty;
    }

    if let Some(zone) = &features.zone_name {
        if let Some(rate) = pattern.zone_acceptance.get(zone) {
            probability -= rate - 0.5;
        }
    }

    probability.clamp(0.0, 1.0)
}

/// Whether the driver's own offer filters let this offer through at all.
pub fn rule_filters_pass(filters: &OfferFilters, features: &OfferFeatures) -> bool {
    if let Some(max_pickup) = filters.max_pickup_distance_m {
        if features.pickup_distance_m > max_pickup {
            return false;
        }
    }
    if let Some(min_fare) = filters.min_fare {
        if features.estimated_fare < min_fare {
            return false;
        }
    }
    if let Some(min_trip) = filters.min_trip_distance_m {
        // An open destination cannot satisfy a minimum-length filter.
        match features.trip_distance_m {
            Some(trip) if trip >= min_trip => {}
            _ => return false,
        }
    }
    if let Some(active_hours) = &filters.active_hours {
        if !active_hours.contains(&features.hour_of_day) {
            return false;
        }
    }
    if let Some(blacklist) = &filters.blacklisted_zones {
        if let Some(zone) = &features.zone_name {
            if blacklist.contains(zone) {
                return false;
            }
        }
    }
    true
}

/// Score in [0,100] the driver client uses to decide on auto-accept. The
/// server only computes and forwards it.
pub fn auto_accept_score(rejection_probability: f64, filters_pass: bool) -> f64 {
    if filters_pass {
        100.0 * (1.0 - rejection_probability)
    } else {
        0.0
    }
}

/// Hot-path read side of the pattern table. Patterns are recomputed by an
/// offline batch; this only caches the latest snapshot per driver.
pub struct Predictor<D: Database> {
    database: D,
    prior: f64,
    earnings_penalty: f64,
    patterns: RwLock<HashMap<Id<Driver>, DriverPattern>>,
}

impl<D: Database> Predictor<D> {
    pub fn new(database: D, prior: f64, earnings_penalty: f64) -> Self {
        Self {
            database,
            prior,
            earnings_penalty,
            patterns: RwLock::new(HashMap::new()),
        }
    }

    pub async fn pattern_for(
        &self,
        driver_id: &Id<Driver>,
        now: DateTime<Utc>,
    ) -> DriverPattern {
        if let Some(pattern) = self.patterns.read().await.get(driver_id) {
            return pattern.clone();
        }
        let pattern = match self.database.auto().get_pattern(driver_id).await {
            Ok(Some(pattern)) => pattern,
            Ok(None) => DriverPattern::empty(driver_id.clone(), now),
            Err(why) => {
                debug!("pattern read for {} failed: {:?}", driver_id, why);
                DriverPattern::empty(driver_id.clone(), now)
            }
        };
        self.patterns
            .write()
            .await
            .insert(driver_id.clone(), pattern.clone());
        pattern
    }

    pub async fn predict(
        &self,
        driver_id: &Id<Driver>,
        features: &OfferFeatures,
        now: DateTime<Utc>,
    ) -> f64 {
        let pattern = self.pattern_for(driver_id, now).await;
        rejection_probability(&pattern, features, self.prior, self.earnings_penalty)
    }

    /// Dropped cache entries re-read the latest batch output on next use.
    pub async fn invalidate(&self) {
        self.patterns.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use model::pattern::BucketRates;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn base_features() -> OfferFeatures {
        OfferFeatures {
            pickup_distance_m: 500.0,
            trip_distance_m: Some(4_000.0),
            estimated_fare: 150.0,
            hour_of_day: 10,
            day_of_week: 2,
            zone_name: None,
            today: DayStats::default(),
        }
    }

    fn pattern() -> DriverPattern {
        let mut pattern =
            DriverPattern::empty(Id::new("drv_1".to_owned()), t0());
        pattern.hourly_acceptance.insert(10, 0.9);
        pattern.avg_accepted_pickup_m = 1_000.0;
        pattern.max_accepted_pickup_m = 4_000.0;
        pattern.bucket_rates = BucketRates {
            short: 0.5,
            medium: 0.5,
            long: 0.5,
        };
        pattern.earnings_threshold = 3_000.0;
        pattern
    }

    #[test]
    fn no_data_falls_back_to_prior() {
        let empty = DriverPattern::empty(Id::new("drv_1".to_owned()), t0());
        let mut features = base_features();
        features.trip_distance_m = None;
        features.pickup_distance_m = 0.0;
        let p = rejection_probability(&empty, &features, 0.2, 0.15);
        assert!((p - 0.2).abs() < 1e-9);
    }

    #[test]
    fn historically_accepting_driver_scores_low() {
        let p = rejection_probability(&pattern(), &base_features(), 0.2, 0.15);
        // Hourly acceptance 0.9, pickup shorter than usual, neutral buckets.
        assert!((p - 0.1).abs() < 1e-9, "got {}", p);
    }

    #[test]
    fn unusually_long_pickup_raises_probability() {
        let mut features = base_features();
        features.pickup_distance_m = 3_000.0;
        let p = rejection_probability(&pattern(), &features, 0.2, 0.15);
        // (3000 - 1000) / 4000 = 0.5 on top of the hourly base.
        assert!((p - 0.6).abs() < 1e-9, "got {}", p);
    }

    #[test]
    fn earnings_past_threshold_add_penalty() {
        let mut features = base_features();
        features.today.earnings = 5_000.0;
        let p = rejection_probability(&pattern(), &features, 0.2, 0.15);
        assert!((p - 0.25).abs() < 1e-9, "got {}", p);
    }

    #[test]
    fn preferred_zone_lowers_probability() {
        let mut pattern = pattern();
        pattern
            .zone_acceptance
            .insert("Station".to_owned(), 0.9);
        let mut features = base_features();
        features.zone_name = Some("Station".to_owned());
        let p = rejection_probability(&pattern, &features, 0.2, 0.15);
        assert!(p < 0.1, "got {}", p);
    }

    #[test]
    fn probability_is_clamped() {
        let mut pattern = pattern();
        pattern.hourly_acceptance.insert(10, 0.0);
        let mut features = base_features();
        features.pickup_distance_m = 50_000.0;
        features.today.earnings = 1e9;
        let p = rejection_probability(&pattern, &features, 0.2, 0.15);
        assert_eq!(p, 1.0);
    }

    #[test]
    fn filters_disqualify_and_zero_the_score() {
        let filters = OfferFilters {
            max_pickup_distance_m: Some(400.0),
            ..OfferFilters::default()
        };
        let features = base_features();
        assert!(!rule_filters_pass(&filters, &features));
        assert_eq!(auto_accept_score(0.1, false), 0.0);
        assert!((auto_accept_score(0.1, true) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn min_trip_filter_fails_open_destination() {
        let filters = OfferFilters {
            min_trip_distance_m: Some(2_000.0),
            ..OfferFilters::default()
        };
        let mut features = base_features();
        features.trip_distance_m = None;
        assert!(!rule_filters_pass(&filters, &features));
    }
}
