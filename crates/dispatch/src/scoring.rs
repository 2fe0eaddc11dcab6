use std::cmp::Ordering;

use itertools::Itertools;
use model::{dispatch_log::ScoreWeights, driver::Driver};
use utility::id::Id;

/// Raw feature vector of one candidate, before normalization.
#[derive(Debug, Clone)]
pub struct CandidateInput {
    pub driver_id: Id<Driver>,
    pub rating: f64,
    pub pickup_distance_m: f64,
    pub predicted_eta_s: f64,
    pub rejection_probability: f64,
    pub today_earnings: f64,
    pub fleet_avg_earnings: f64,
    /// Pattern acceptance at the pickup zone; 0.5 when unknown.
    pub zone_preference: f64,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub driver_id: Id<Driver>,
    pub score: f64,
    pub rating: f64,
    pub pickup_distance_m: f64,
    pub predicted_eta_s: f64,
    pub rejection_probability: f64,
    pub reason: String,
}

/// Min-max normalization across the candidate set; a degenerate span maps
/// everyone to the neutral 0.5.
fn normalized(value: f64, min: f64, max: f64) -> f64 {
    let span = max - min;
    if span.abs() < 1e-12 {
        0.5
    } else {
        (value - min) / span
    }
}

struct FeatureRange {
    min: f64,
    max: f64,
}

fn range(values: impl Iterator<Item = f64>) -> FeatureRange {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in values {
        min = min.min(value);
        max = max.max(value);
    }
    FeatureRange { min, max }
}

/// Scores every candidate as a weighted sum over its normalized features
/// and returns them best first. Ties break on rating, then on lower id, so
/// the ranking is stable across runs.
pub fn rank(
    candidates: &[CandidateInput],
    weights: &ScoreWeights,
) -> Vec<ScoredCandidate> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let distance = range(candidates.iter().map(|c| c.pickup_distance_m));
    let eta = range(candidates.iter().map(|c| c.predicted_eta_s));
    let rejection = range(candidates.iter().map(|c| c.rejection_probability));
    let balance = range(
        candidates
            .iter()
            .map(|c| c.fleet_avg_earnings - c.today_earnings),
    );
    let zone = range(candidates.iter().map(|c| c.zone_preference));
    let rating = range(candidates.iter().map(|c| c.rating));

    candidates
        .iter()
        .map(|candidate| {
            // Lower-better features contribute inverted.
            let score = weights.pickup_distance
                * (1.0
                    - normalized(
                        candidate.pickup_distance_m,
                        distance.min,
                        distance.max,
                    ))
                + weights.predicted_eta
                    * (1.0 - normalized(candidate.predicted_eta_s, eta.min, eta.max))
                + weights.rejection_probability
                    * (1.0
                        - normalized(
                            candidate.rejection_probability,
                            rejection.min,
                            rejection.max,
                        ))
                + weights.earnings_balance
                    * normalized(
                        candidate.fleet_avg_earnings - candidate.today_earnings,
                        balance.min,
                        balance.max,
                    )
                + weights.zone_preference
                    * normalized(candidate.zone_preference, zone.min, zone.max)
                + weights.rating
                    * normalized(candidate.rating, rating.min, rating.max);

            ScoredCandidate {
                driver_id: candidate.driver_id.clone(),
                score,
                rating: candidate.rating,
                pickup_distance_m: candidate.pickup_distance_m,
                predicted_eta_s: candidate.predicted_eta_s,
                rejection_probability: candidate.rejection_probability,
                reason: format!(
                    "dist={:.0}m eta={:.0}s rej={:.2} rating={:.1}",
                    candidate.pickup_distance_m,
                    candidate.predicted_eta_s,
                    candidate.rejection_probability,
                    candidate.rating,
                ),
            }
        })
        .sorted_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.rating.partial_cmp(&a.rating).unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, distance_m: f64, rating: f64) -> CandidateInput {
        CandidateInput {
            driver_id: Id::new(id.to_owned()),
            rating,
            pickup_distance_m: distance_m,
            predicted_eta_s: distance_m / 11.0,
            rejection_probability: 0.0,
            today_earnings: 1_000.0,
            fleet_avg_earnings: 1_000.0,
            zone_preference: 0.5,
        }
    }

    #[test]
    fn closest_driver_ranks_first() {
        let candidates = vec![
            candidate("drv_3", 1_200.0, 4.5),
            candidate("drv_1", 300.0, 4.8),
            candidate("drv_2", 600.0, 4.5),
        ];
        let ranked = rank(&candidates, &ScoreWeights::default());
        let order: Vec<String> =
            ranked.iter().map(|c| c.driver_id.raw()).collect();
        assert_eq!(order, vec!["drv_1", "drv_2", "drv_3"]);
    }

    #[test]
    fn high_rejection_probability_pushes_a_driver_down() {
        let mut near_but_flaky = candidate("drv_1", 300.0, 4.5);
        near_but_flaky.rejection_probability = 0.95;
        let steady = candidate("drv_2", 400.0, 4.5);

        let ranked = rank(
            &[near_but_flaky, steady],
            &ScoreWeights::default(),
        );
        assert_eq!(ranked[0].driver_id.raw(), "drv_2");
    }

    #[test]
    fn ties_break_on_rating_then_lower_id() {
        let a = candidate("drv_b", 500.0, 4.2);
        let b = candidate("drv_a", 500.0, 4.2);
        let c = candidate("drv_c", 500.0, 4.9);

        let ranked = rank(&[a, b, c], &ScoreWeights::default());
        let order: Vec<String> =
            ranked.iter().map(|c| c.driver_id.raw()).collect();
        assert_eq!(order, vec!["drv_c", "drv_a", "drv_b"]);
    }

    #[test]
    fn below_average_earners_are_preferred() {
        let mut rich = candidate("drv_1", 500.0, 4.5);
        rich.today_earnings = 4_000.0;
        rich.fleet_avg_earnings = 2_000.0;
        let mut poor = candidate("drv_2", 500.0, 4.5);
        poor.today_earnings = 500.0;
        poor.fleet_avg_earnings = 2_000.0;

        let ranked = rank(&[rich, poor], &ScoreWeights::default());
        assert_eq!(ranked[0].driver_id.raw(), "drv_2");
    }

    #[test]
    fn empty_input_yields_empty_ranking() {
        assert!(rank(&[], &ScoreWeights::default()).is_empty());
    }
}
