//! Workload balance sub-score
//!
//! Three interchangeable formulations over the per-agent attempt counts.
//! All of them land in [-2, 2] except entropy, which spans [0, 2.8].

use serde::{Deserialize, Serialize};

const QUADRATIC_MAX: f64 = 2.0;
const QUADRATIC_MIN: f64 = -2.0;
const ENTROPY_SCALE: f64 = 2.8;
const MSD_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStrategy {
    /// Peak when the agents together attempt exactly every target
    #[default]
    Quadratic,
    /// Normalized Shannon entropy of the workload split
    Entropy,
    /// Mean squared deviation from an even split of the targets
    Msd,
}

impl BalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceStrategy::Quadratic => "quadratic",
            BalanceStrategy::Entropy => "entropy",
            BalanceStrategy::Msd => "msd",
        }
    }

    /// Score `counts` against `total_methods` targets. `total_methods` must be non-zero.
    pub fn score(&self, counts: &[usize], total_methods: usize) -> f64 {
        match self {
            BalanceStrategy::Quadratic => quadratic(counts.iter().sum(), total_methods),
            BalanceStrategy::Entropy => entropy(counts),
            BalanceStrategy::Msd => msd(counts, total_methods),
        }
    }
}

impl std::fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Balance outcome; `Terminate` replaces the number for degenerate rounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceScore {
    Score(f64),
    Terminate,
}

impl BalanceScore {
    pub fn value(&self) -> Option<f64> {
        match self {
            BalanceScore::Score(v) => Some(*v),
            BalanceScore::Terminate => None,
        }
    }
}

/// `2 - 4(S-V)^2 / V^2`, clamped to [-2, 2].
pub fn quadratic(attempted: usize, total_methods: usize) -> f64 {
    let v = total_methods as f64;
    let diff = attempted as f64 - v;
    (QUADRATIC_MAX - 4.0 * diff * diff / (v * v)).clamp(QUADRATIC_MIN, QUADRATIC_MAX)
}

/// `2.8 * H / ln(N)`; zero for a single agent or no attempts.
pub fn entropy(counts: &[usize]) -> f64 {
    let agents = counts.len();
    let total: usize = counts.iter().sum();
    if agents <= 1 || total == 0 {
        return 0.0;
    }

    let h: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * p.ln()
        })
        .sum();
    ENTROPY_SCALE * (h / (agents as f64).ln()).clamp(0.0, 1.0)
}

/// Deviation of each agent's count from `V / N`, rescaled into [-2, 2].
pub fn msd(counts: &[usize], total_methods: usize) -> f64 {
    if counts.is_empty() {
        return QUADRATIC_MIN;
    }
    let n = counts.len() as f64;
    let v = total_methods as f64;
    let target = v / n;

    let deviation = counts
        .iter()
        .map(|&c| {
            let d = c as f64 - target;
            d * d
        })
        .sum::<f64>()
        / n;
    let worst = (v * v / n) * (1.0 - 1.0 / n);

    let closeness = (1.0 - deviation / (worst + MSD_EPSILON)).max(0.0);
    (4.0 * closeness - 2.0).clamp(QUADRATIC_MIN, QUADRATIC_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quadratic_peaks_at_full_coverage() {
        assert_eq!(quadratic(2, 2), 2.0);
        assert_eq!(quadratic(0, 4), -2.0);
        assert_eq!(quadratic(8, 4), -2.0);
        assert!((quadratic(3, 4) - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_rewards_even_split() {
        assert!((entropy(&[3, 3]) - 2.8).abs() < 1e-12);
        assert_eq!(entropy(&[4, 0]), 0.0);
        assert_eq!(entropy(&[5]), 0.0);
        assert_eq!(entropy(&[0, 0, 0]), 0.0);
        let skewed = entropy(&[3, 1]);
        assert!(skewed > 0.0 && skewed < 2.8);
    }

    #[test]
    fn test_msd_extremes() {
        assert!((msd(&[2, 2], 4) - 2.0).abs() < 1e-9);
        // all work on one agent is the worst split
        assert!((msd(&[4, 0], 4) + 2.0).abs() < 1e-6);
        assert_eq!(msd(&[], 4), -2.0);
        assert!((msd(&[3], 3) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_dispatch_and_names() {
        assert_eq!(BalanceStrategy::default(), BalanceStrategy::Quadratic);
        assert_eq!(BalanceStrategy::Quadratic.score(&[1, 1], 2), 2.0);
        assert_eq!(BalanceStrategy::Msd.to_string(), "msd");
        let parsed: BalanceStrategy = serde_json::from_str("\"entropy\"").unwrap();
        assert_eq!(parsed, BalanceStrategy::Entropy);
    }

    proptest! {
        #[test]
        fn prop_quadratic_symmetric_and_maximal(v in 1usize..200, d in 0usize..200) {
            let d = d % (v + 1);
            let below = quadratic(v - d, v);
            let above = quadratic(v + d, v);
            prop_assert!((below - above).abs() < 1e-9);
            prop_assert!(below <= quadratic(v, v));
        }

        #[test]
        fn prop_scores_stay_in_range(counts in prop::collection::vec(0usize..20, 0..6), v in 1usize..40) {
            for strategy in [BalanceStrategy::Quadratic, BalanceStrategy::Msd] {
                let s = strategy.score(&counts, v);
                prop_assert!((-2.0..=2.0).contains(&s));
            }
            let e = entropy(&counts);
            prop_assert!((0.0..=2.8 + 1e-9).contains(&e));
        }
    }
}
