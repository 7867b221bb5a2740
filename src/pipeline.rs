//! One scoring round end to end
//!
//! select -> merge -> run tests -> attribute -> reward. Each call owns all of
//! its state, so rounds can be scored concurrently.

use crate::attribution::attribute_tests_to_methods;
use crate::config::Config;
use crate::error::ConfigurationError;
use crate::merge::{merge_with, select, Selection, SourceFormatter, Visibility};
use crate::reward::{compute_reward, RewardInputs, RewardVector};
use crate::sandbox::{Executor, TestRunResult};
use crate::skeleton::Skeleton;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable description of one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringTask {
    pub class_name: String,
    /// Target methods; empty means every stub in the class
    #[serde(rename = "methods", default)]
    pub method_names: Vec<String>,
    pub skeleton: String,
    #[serde(rename = "tests")]
    pub test_source: String,
    #[serde(default)]
    pub partition: Option<BTreeMap<String, usize>>,
    #[serde(default)]
    pub self_select: bool,
}

impl ScoringTask {
    pub fn visibility(&self) -> Visibility {
        Visibility::from_parts(self.partition.clone(), self.self_select)
    }

    /// Parse the skeleton and resolve the target list.
    pub fn targets(&self) -> Result<Vec<String>, ConfigurationError> {
        Skeleton::parse(&self.skeleton, &self.class_name)?.resolve_targets(&self.method_names)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionSummary {
    /// method -> index of the agent whose snippet was spliced in
    pub selected_from: BTreeMap<String, usize>,
    pub attempts_per_agent: Vec<usize>,
    pub candidates: usize,
    pub invalid_candidates: usize,
}

impl From<&Selection> for SelectionSummary {
    fn from(selection: &Selection) -> Self {
        Self {
            selected_from: selection
                .selected
                .iter()
                .map(|(method, c)| (method.clone(), c.agent_index))
                .collect(),
            attempts_per_agent: selection.attempts_per_agent.clone(),
            candidates: selection.candidates.len(),
            invalid_candidates: selection.invalid_candidates(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundScore {
    pub targets: Vec<String>,
    pub merged_module: String,
    pub selection: SelectionSummary,
    pub test_result: TestRunResult,
    pub attribution: BTreeMap<String, BTreeSet<String>>,
    pub reward: RewardVector,
}

/// Score one round of agent completions against `task`.
pub fn score_round<S, R>(
    task: &ScoringTask,
    agent_texts: &[S],
    config: &Config,
    executor: &dyn Executor,
    rng: &mut R,
) -> Result<RoundScore, ConfigurationError>
where
    S: AsRef<str>,
    R: Rng + ?Sized,
{
    config.validate()?;
    let targets = task.targets()?;
    let selection = select(agent_texts, &targets, &task.visibility(), rng)?;

    let formatter = config.merge.formatter();
    let merged_module = merge_with(
        &task.skeleton,
        &task.class_name,
        &selection.code_by_method(),
        formatter.as_ref().map(|f| f as &dyn SourceFormatter),
    )?;

    let test_result = executor.run(&merged_module, &task.test_source, config.sandbox.timeout());
    let attribution = attribute_tests_to_methods(&task.test_source, &targets, &task.class_name);
    let attributed = attribution.values().any(|methods| !methods.is_empty());

    let implemented = selection.implemented();
    let reward = compute_reward(
        &config.reward,
        &RewardInputs {
            total_methods: targets.len(),
            per_agent_counts: &selection.attempts_per_agent,
            test_result: &test_result,
            attribution: attributed.then_some(&attribution),
            implemented: &implemented,
        },
    )?;

    tracing::debug!(
        class = %task.class_name,
        selected = implemented.len(),
        targets = targets.len(),
        passed = test_result.passed,
        total = test_result.total,
        reward = reward.total,
        "scored round"
    );

    Ok(RoundScore {
        targets,
        merged_module,
        selection: SelectionSummary::from(&selection),
        test_result,
        attribution,
        reward,
    })
}

/// Score many rollouts of the same task in parallel.
///
/// Rollout `i` draws from its own `StdRng` seeded with `seed + i`, so the
/// batch is reproducible regardless of scheduling.
pub fn score_batch<S>(
    task: &ScoringTask,
    rollouts: &[Vec<S>],
    config: &Config,
    executor: &dyn Executor,
    seed: u64,
) -> Result<Vec<RoundScore>, ConfigurationError>
where
    S: AsRef<str> + Sync,
{
    config.validate()?;
    task.targets()?;

    rollouts
        .par_iter()
        .enumerate()
        .map(|(index, agent_texts)| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(index as u64));
            score_round(task, agent_texts, config, executor, &mut rng)
        })
        .collect()
}
