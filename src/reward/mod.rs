//! Composite reward for one scoring round
//!
//! Combines balance, syntax, test and component sub-scores into a single
//! [`RewardVector`]. Everything here is a pure function of its inputs.

mod balance;

pub use balance::{entropy, msd, quadratic, BalanceScore, BalanceStrategy};

use crate::attribution::tests_by_method;
use crate::error::ConfigurationError;
use crate::sandbox::{TestOutcome, TestRunResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Weights and ranges for the reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub balance_strategy: BalanceStrategy,
    /// Terminate when the summed attempts exceed this multiple of the target count
    pub terminate_ratio: f64,
    /// Total reported for a terminated round
    pub terminate_penalty: f64,
    pub syntax_score: f64,
    pub tests_max: f64,
    pub components_max: f64,
    /// Average pass rates per attributed method instead of over all tests
    pub weight_tests_by_method: bool,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            balance_strategy: BalanceStrategy::Quadratic,
            terminate_ratio: 2.0,
            terminate_penalty: -2.0,
            syntax_score: 2.0,
            tests_max: 4.0,
            components_max: 1.0,
            weight_tests_by_method: false,
        }
    }
}

impl RewardConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let non_negative = [
            ("syntax_score", self.syntax_score),
            ("tests_max", self.tests_max),
            ("components_max", self.components_max),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::InvalidConfig(format!(
                    "reward.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if !self.terminate_ratio.is_finite() || self.terminate_ratio <= 0.0 {
            return Err(ConfigurationError::InvalidConfig(format!(
                "reward.terminate_ratio must be positive, got {}",
                self.terminate_ratio
            )));
        }
        if !self.terminate_penalty.is_finite() {
            return Err(ConfigurationError::InvalidConfig(
                "reward.terminate_penalty must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the reward depends on for one round.
#[derive(Debug, Clone, Copy)]
pub struct RewardInputs<'a> {
    /// V, the number of target methods
    pub total_methods: usize,
    /// s_i, distinct target methods each agent attempted
    pub per_agent_counts: &'a [usize],
    pub test_result: &'a TestRunResult,
    pub attribution: Option<&'a BTreeMap<String, BTreeSet<String>>>,
    /// Target methods that received a selected, syntax-valid implementation
    pub implemented: &'a BTreeSet<String>,
}

/// Raw counts behind the sub-scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardDiagnostics {
    pub strategy: BalanceStrategy,
    pub total_methods: usize,
    pub agents: usize,
    pub attempted: usize,
    pub per_agent_counts: Vec<usize>,
    pub syntax_ok: bool,
    pub tests_passed: usize,
    pub tests_total: usize,
    pub tests_timed_out: usize,
    pub collection_error: bool,
    pub test_ratio: f64,
    pub implemented: usize,
    /// Implemented targets whose attributed tests all pass
    pub verified_methods: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Healthy,
    /// Syntax errors or failing tests
    BadCode,
    /// Over-attempted or badly split workload
    MisCoordinated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardVector {
    pub balance: BalanceScore,
    pub syntax: f64,
    pub tests: f64,
    pub components: f64,
    pub total: f64,
    pub terminated: bool,
    pub diagnostics: RewardDiagnostics,
}

impl RewardVector {
    /// Dominant cause of a low score.
    ///
    /// Termination always counts as mis-coordination. Otherwise broken code
    /// wins over a negative balance.
    pub fn failure_kind(&self) -> FailureKind {
        if self.terminated {
            return FailureKind::MisCoordinated;
        }
        let d = &self.diagnostics;
        if !d.syntax_ok || d.tests_total == 0 || d.tests_passed < d.tests_total {
            return FailureKind::BadCode;
        }
        match self.balance.value() {
            Some(v) if v < 0.0 => FailureKind::MisCoordinated,
            _ => FailureKind::Healthy,
        }
    }
}

/// Score one round.
///
/// Only a broken task (`total_methods == 0`) or bad config raises; every
/// agent-quality problem is expressed in the returned vector.
pub fn compute_reward(
    config: &RewardConfig,
    inputs: &RewardInputs<'_>,
) -> Result<RewardVector, ConfigurationError> {
    config.validate()?;
    if inputs.total_methods == 0 {
        return Err(ConfigurationError::InvalidConfig(
            "reward needs at least one target method".to_string(),
        ));
    }

    let v = inputs.total_methods;
    let result = inputs.test_result;
    let attempted: usize = inputs.per_agent_counts.iter().sum();
    let test_ratio = test_ratio(config, inputs);
    let verified_methods = verified_methods(inputs);

    let mut diagnostics = RewardDiagnostics {
        strategy: config.balance_strategy,
        total_methods: v,
        agents: inputs.per_agent_counts.len(),
        attempted,
        per_agent_counts: inputs.per_agent_counts.to_vec(),
        syntax_ok: result.syntax_ok,
        tests_passed: result.passed,
        tests_total: result.total,
        tests_timed_out: result.timed_out.len(),
        collection_error: result.collection_error.is_some(),
        test_ratio,
        implemented: inputs.implemented.len(),
        verified_methods,
    };

    if attempted as f64 > config.terminate_ratio * v as f64 {
        tracing::debug!(attempted, targets = v, "attempts exceed limit; terminating round");
        diagnostics.test_ratio = 0.0;
        return Ok(RewardVector {
            balance: BalanceScore::Terminate,
            syntax: 0.0,
            tests: 0.0,
            components: 0.0,
            total: config.terminate_penalty,
            terminated: true,
            diagnostics,
        });
    }

    let balance = config.balance_strategy.score(inputs.per_agent_counts, v);
    let syntax = if result.syntax_ok {
        config.syntax_score
    } else {
        0.0
    };
    let tests = config.tests_max * test_ratio;
    let components = config.components_max * (verified_methods as f64 / v as f64).min(1.0);

    Ok(RewardVector {
        balance: BalanceScore::Score(balance),
        syntax,
        tests,
        components,
        total: balance + syntax + tests + components,
        terminated: false,
        diagnostics,
    })
}

fn passed(result: &TestRunResult, test_id: &str) -> bool {
    result.outcome(test_id) == Some(TestOutcome::Pass)
}

fn test_ratio(config: &RewardConfig, inputs: &RewardInputs<'_>) -> f64 {
    let result = inputs.test_result;
    if !result.syntax_ok {
        return 0.0;
    }
    let plain = result.pass_rate();
    if !config.weight_tests_by_method {
        return plain;
    }
    let Some(attribution) = inputs.attribution else {
        return plain;
    };

    let by_method = tests_by_method(attribution);
    if by_method.is_empty() {
        return plain;
    }
    let per_method: f64 = by_method
        .values()
        .map(|tests| {
            let ok = tests.iter().filter(|t| passed(result, t)).count();
            ok as f64 / tests.len() as f64
        })
        .sum();
    per_method / by_method.len() as f64
}

fn verified_methods(inputs: &RewardInputs<'_>) -> usize {
    let result = inputs.test_result;
    if !result.syntax_ok {
        return 0;
    }
    match inputs.attribution {
        Some(attribution) => {
            let by_method = tests_by_method(attribution);
            inputs
                .implemented
                .iter()
                .filter(|method| {
                    by_method
                        .get(method.as_str())
                        .map(|tests| tests.iter().all(|t| passed(result, t)))
                        .unwrap_or(false)
                })
                .count()
        }
        None if result.all_passed() => inputs.implemented.len(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::TestCaseReport;
    use proptest::prelude::*;

    fn run(outcomes: &[(&str, TestOutcome)]) -> TestRunResult {
        TestRunResult::from_outcomes(
            true,
            outcomes
                .iter()
                .map(|(id, outcome)| match outcome {
                    TestOutcome::Pass => TestCaseReport::passed(id),
                    other => TestCaseReport::failed(id, *other, "x"),
                })
                .collect(),
        )
    }

    fn attribution(pairs: &[(&str, &str)]) -> BTreeMap<String, BTreeSet<String>> {
        pairs
            .iter()
            .map(|(test, method)| (test.to_string(), BTreeSet::from([method.to_string()])))
            .collect()
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_perfect_two_agent_round() {
        let result = run(&[
            ("test_foo (T)", TestOutcome::Pass),
            ("test_bar (T)", TestOutcome::Pass),
        ]);
        let attr = attribution(&[("test_foo (T)", "foo"), ("test_bar (T)", "bar")]);
        let implemented = names(&["foo", "bar"]);
        let reward = compute_reward(
            &RewardConfig::default(),
            &RewardInputs {
                total_methods: 2,
                per_agent_counts: &[1, 1],
                test_result: &result,
                attribution: Some(&attr),
                implemented: &implemented,
            },
        )
        .unwrap();

        assert_eq!(reward.balance, BalanceScore::Score(2.0));
        assert_eq!(reward.syntax, 2.0);
        assert_eq!(reward.tests, 4.0);
        assert_eq!(reward.components, 1.0);
        assert_eq!(reward.total, 9.0);
        assert!(!reward.terminated);
        assert_eq!(reward.failure_kind(), FailureKind::Healthy);
    }

    #[test]
    fn test_full_overlap_hits_lower_clamp() {
        let result = run(&[("t1", TestOutcome::Pass)]);
        let implemented = names(&["a", "b", "c", "d"]);
        let reward = compute_reward(
            &RewardConfig::default(),
            &RewardInputs {
                total_methods: 4,
                per_agent_counts: &[4, 4],
                test_result: &result,
                attribution: None,
                implemented: &implemented,
            },
        )
        .unwrap();
        assert_eq!(reward.balance, BalanceScore::Score(-2.0));
        assert!(!reward.terminated);
        assert_eq!(reward.components, 1.0);
        assert_eq!(reward.failure_kind(), FailureKind::MisCoordinated);
    }

    #[test]
    fn test_syntax_failure_zeroes_code_scores() {
        let result = TestRunResult::syntax_failure(&["t1".to_string()], "syntax error");
        let implemented = names(&["foo"]);
        let reward = compute_reward(
            &RewardConfig::default(),
            &RewardInputs {
                total_methods: 1,
                per_agent_counts: &[1],
                test_result: &result,
                attribution: None,
                implemented: &implemented,
            },
        )
        .unwrap();
        assert_eq!((reward.syntax, reward.tests, reward.components), (0.0, 0.0, 0.0));
        assert_eq!(reward.total, 2.0);
        assert_eq!(reward.failure_kind(), FailureKind::BadCode);
    }

    #[test]
    fn test_components_count_only_fully_passing_methods() {
        let result = run(&[
            ("test_foo", TestOutcome::Pass),
            ("test_foo_edge", TestOutcome::Fail),
            ("test_bar", TestOutcome::Pass),
            ("test_baz", TestOutcome::Pass),
        ]);
        let attr = attribution(&[
            ("test_foo", "foo"),
            ("test_foo_edge", "foo"),
            ("test_bar", "bar"),
            ("test_baz", "baz"),
        ]);
        // baz passes its test but was never implemented
        let implemented = names(&["foo", "bar"]);
        let inputs = RewardInputs {
            total_methods: 4,
            per_agent_counts: &[2, 2],
            test_result: &result,
            attribution: Some(&attr),
            implemented: &implemented,
        };

        let reward = compute_reward(&RewardConfig::default(), &inputs).unwrap();
        assert_eq!(reward.diagnostics.verified_methods, 1);
        assert_eq!(reward.components, 0.25);
        assert_eq!(reward.tests, 3.0);

        let weighted = RewardConfig {
            weight_tests_by_method: true,
            ..RewardConfig::default()
        };
        let reward = compute_reward(&weighted, &inputs).unwrap();
        // foo 1/2, bar 1, baz 1
        assert!((reward.diagnostics.test_ratio - 2.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_configuration_errors() {
        let result = run(&[]);
        let implemented = BTreeSet::new();
        let inputs = RewardInputs {
            total_methods: 0,
            per_agent_counts: &[],
            test_result: &result,
            attribution: None,
            implemented: &implemented,
        };
        assert!(compute_reward(&RewardConfig::default(), &inputs).is_err());

        let bad = RewardConfig {
            tests_max: -1.0,
            ..RewardConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigurationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_strategy_name_is_reported() {
        let result = run(&[("t", TestOutcome::Pass)]);
        let implemented = names(&["a"]);
        let config = RewardConfig {
            balance_strategy: BalanceStrategy::Entropy,
            ..RewardConfig::default()
        };
        let reward = compute_reward(
            &config,
            &RewardInputs {
                total_methods: 2,
                per_agent_counts: &[1, 1],
                test_result: &result,
                attribution: None,
                implemented: &implemented,
            },
        )
        .unwrap();
        assert_eq!(reward.diagnostics.strategy, BalanceStrategy::Entropy);
        assert!((reward.balance.value().unwrap() - 2.8).abs() < 1e-12);
        let json = serde_json::to_value(&reward).unwrap();
        assert_eq!(json["diagnostics"]["strategy"], "entropy");
    }

    proptest! {
        #[test]
        fn prop_overattempt_always_terminates(
            mut counts in prop::collection::vec(0usize..30, 0..4),
            v in 1usize..20,
            extra in 1usize..10,
        ) {
            counts.push(2 * v + extra);
            let result = run(&[("t", TestOutcome::Pass)]);
            let implemented = BTreeSet::new();
            let reward = compute_reward(
                &RewardConfig::default(),
                &RewardInputs {
                    total_methods: v,
                    per_agent_counts: &counts,
                    test_result: &result,
                    attribution: None,
                    implemented: &implemented,
                },
            ).unwrap();
            prop_assert!(reward.terminated);
            prop_assert_eq!(reward.balance, BalanceScore::Terminate);
            prop_assert_eq!(reward.total, -2.0);
            prop_assert_eq!(reward.failure_kind(), FailureKind::MisCoordinated);
        }
    }
}
