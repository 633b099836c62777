//! Differential-Privacy Primitives
//! ===============================
//! Randomized response, the Laplace mechanism for bounded severities, and
//! the k-anonymity threshold for collective threat sharing.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::error::MeshError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Differential privacy for threat signal sharing.
///
/// - `epsilon`: privacy budget. Lower = more private, higher = more
///   accurate. Typical range 0.1 to 10.0.
/// - `k_anonymity`: minimum unique reporters before a signal is shared.
pub struct DifferentialPrivacy {
    epsilon: f64,
    k_anonymity: u32,
    // Uniform, seedable RNG. Seeding is for tests only.
    rng: Mutex<StdRng>,
}

impl DifferentialPrivacy {
    pub fn new(epsilon: f64, k_anonymity: u32) -> Result<Self, MeshError> {
        Self::build(epsilon, k_anonymity, StdRng::from_entropy())
    }

    /// Deterministic instance for tests. Never seed production engines.
    pub fn with_seed(epsilon: f64, k_anonymity: u32, seed: u64) -> Result<Self, MeshError> {
        Self::build(epsilon, k_anonymity, StdRng::seed_from_u64(seed))
    }

    fn build(epsilon: f64, k_anonymity: u32, rng: StdRng) -> Result<Self, MeshError> {
        if epsilon <= 0.0 {
            return Err(MeshError::Validation("epsilon must be positive".to_string()));
        }
        if k_anonymity < 1 {
            return Err(MeshError::Validation(
                "k_anonymity must be at least 1".to_string(),
            ));
        }
        Ok(DifferentialPrivacy {
            epsilon,
            k_anonymity,
            rng: Mutex::new(rng),
        })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn k_anonymity(&self) -> u32 {
        self.k_anonymity
    }

    /// Report the true value with probability p = e^eps / (1 + e^eps),
    /// otherwise flip it. Provides epsilon-differential privacy for binary
    /// attributes.
    pub fn randomized_response(&self, true_value: bool) -> bool {
        let p = self.epsilon.exp() / (1.0 + self.epsilon.exp());
        if self.rng.lock().gen::<f64>() < p {
            true_value
        } else {
            !true_value
        }
    }

    /// Laplace mechanism for severities bounded in [0, 1] (sensitivity 1):
    /// noise ~ Laplace(0, 1/eps) via inverse CDF, clamped back into range
    /// and rounded to 2 decimal places.
    pub fn add_noise_to_severity(&self, severity: f64) -> f64 {
        let scale = 1.0 / self.epsilon;

        let u: f64 = self.rng.lock().gen::<f64>() - 0.5;
        let noise = -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln();

        let noised = (severity + noise).clamp(0.0, 1.0);
        (noised * 100.0).round() / 100.0
    }

    /// Whether a signal has enough unique reporters to be shared.
    pub fn meets_k_anonymity(&self, reporter_count: u32) -> bool {
        reporter_count >= self.k_anonymity
    }

    /// Confidence = crowd factor (diminishing returns up to 10 reporters)
    /// times report consistency.
    pub fn calculate_confidence(&self, reporter_count: u32, consistency: f64) -> f64 {
        let crowd_factor = (reporter_count as f64 / 10.0).min(1.0);
        let confidence = crowd_factor * consistency;
        (confidence * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(DifferentialPrivacy::new(0.0, 3).is_err());
        assert!(DifferentialPrivacy::new(-1.0, 3).is_err());
        assert!(DifferentialPrivacy::new(1.0, 0).is_err());
        assert!(DifferentialPrivacy::new(1.0, 1).is_ok());
    }

    #[test]
    fn test_high_epsilon_rarely_flips() {
        let dp = DifferentialPrivacy::with_seed(10.0, 3, 42).unwrap();
        let flips = (0..1000)
            .filter(|_| !dp.randomized_response(true))
            .count();
        // p(truth) = e^10/(1+e^10) ~ 0.99995.
        assert!(flips < 5, "unexpected flip count: {flips}");
    }

    #[test]
    fn test_tiny_epsilon_is_a_coin_flip() {
        let dp = DifferentialPrivacy::with_seed(0.01, 3, 42).unwrap();
        let suppressed = (0..10_000)
            .filter(|_| !dp.randomized_response(true))
            .count();
        // p(flip) ~ 0.4975; allow generous statistical slack.
        assert!(
            (4_500..=5_500).contains(&suppressed),
            "suppression rate far from a coin flip: {suppressed}"
        );
    }

    #[test]
    fn test_noise_stays_bounded_and_rounded() {
        let dp = DifferentialPrivacy::with_seed(1.0, 3, 7).unwrap();
        for _ in 0..1000 {
            let noised = dp.add_noise_to_severity(0.9);
            assert!((0.0..=1.0).contains(&noised));
            let cents = noised * 100.0;
            assert!((cents - cents.round()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_noise_mean_tracks_truth_under_low_privacy() {
        let dp = DifferentialPrivacy::with_seed(10.0, 3, 7).unwrap();
        let n = 5_000;
        let mean: f64 =
            (0..n).map(|_| dp.add_noise_to_severity(0.7)).sum::<f64>() / n as f64;
        assert!((mean - 0.7).abs() < 0.05, "mean drifted: {mean}");
    }

    #[test]
    fn test_k_anonymity_threshold() {
        let dp = DifferentialPrivacy::with_seed(1.0, 3, 1).unwrap();
        assert!(!dp.meets_k_anonymity(2));
        assert!(dp.meets_k_anonymity(3));
        assert!(dp.meets_k_anonymity(10));
    }

    #[test]
    fn test_confidence_formula() {
        let dp = DifferentialPrivacy::with_seed(1.0, 3, 1).unwrap();
        assert_eq!(dp.calculate_confidence(10, 1.0), 1.0);
        assert_eq!(dp.calculate_confidence(20, 1.0), 1.0);
        assert_eq!(dp.calculate_confidence(5, 1.0), 0.5);
        assert_eq!(dp.calculate_confidence(5, 0.5), 0.25);
        assert_eq!(dp.calculate_confidence(0, 1.0), 0.0);
    }
}
