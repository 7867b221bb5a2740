//! Candidate aggregation and selection across agents

use crate::error::ConfigurationError;
use crate::extract::extract_snippets;
use crate::python::is_valid_method_snippet;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which target methods each agent may submit for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Every agent sees every target method
    SelfSelect,
    /// method name -> index of the single agent allowed to implement it
    Partition(BTreeMap<String, usize>),
}

impl Visibility {
    /// Self-select wins when both are given; neither means self-select.
    pub fn from_parts(partition: Option<BTreeMap<String, usize>>, self_select: bool) -> Self {
        match (partition, self_select) {
            (_, true) => Visibility::SelfSelect,
            (Some(partition), false) => Visibility::Partition(partition),
            (None, false) => {
                tracing::warn!("no partition and self-select disabled; treating as self-select");
                Visibility::SelfSelect
            }
        }
    }

    /// Target methods visible to `agent`, in target order.
    pub fn visible_to(&self, agent: usize, targets: &[String]) -> Vec<String> {
        match self {
            Visibility::SelfSelect => targets.to_vec(),
            Visibility::Partition(partition) => targets
                .iter()
                .filter(|m| partition.get(m.as_str()) == Some(&agent))
                .cloned()
                .collect(),
        }
    }

    fn check(&self, targets: &[String], agents: usize) -> Result<(), ConfigurationError> {
        let Visibility::Partition(partition) = self else {
            return Ok(());
        };
        for method in targets {
            match partition.get(method) {
                Some(&agent) if agent >= agents => {
                    return Err(ConfigurationError::PartitionOutOfRange {
                        method: method.clone(),
                        agent,
                        agents,
                    });
                }
                Some(_) => {}
                None => tracing::debug!(method = %method, "target method not assigned to any agent"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateSnippet {
    pub method_name: String,
    pub source: String,
    pub agent_index: usize,
    pub syntax_valid: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Selection {
    /// At most one chosen candidate per method; always syntax-valid
    pub selected: BTreeMap<String, CandidateSnippet>,
    /// Every candidate extracted, valid or not
    pub candidates: Vec<CandidateSnippet>,
    /// Distinct visible target methods each agent produced a snippet for
    pub attempts_per_agent: Vec<usize>,
}

impl Selection {
    pub fn code_by_method(&self) -> BTreeMap<String, String> {
        self.selected
            .iter()
            .map(|(name, c)| (name.clone(), c.source.clone()))
            .collect()
    }

    pub fn implemented(&self) -> BTreeSet<String> {
        self.selected.keys().cloned().collect()
    }

    pub fn invalid_candidates(&self) -> usize {
        self.candidates.iter().filter(|c| !c.syntax_valid).count()
    }
}

/// Extract every agent's candidates and pick one valid snippet per method.
///
/// Among several valid candidates the pick is uniform over `rng`; a method
/// whose candidates are all invalid is left out so its stub stays in place.
pub fn select<S, R>(
    agent_texts: &[S],
    method_names: &[String],
    visibility: &Visibility,
    rng: &mut R,
) -> Result<Selection, ConfigurationError>
where
    S: AsRef<str>,
    R: Rng + ?Sized,
{
    visibility.check(method_names, agent_texts.len())?;

    let mut by_method: BTreeMap<&str, Vec<CandidateSnippet>> = BTreeMap::new();
    let mut attempts_per_agent = Vec::with_capacity(agent_texts.len());

    for (agent_index, text) in agent_texts.iter().enumerate() {
        let visible = visibility.visible_to(agent_index, method_names);
        let snippets = extract_snippets(text.as_ref(), &visible);
        attempts_per_agent.push(snippets.len());

        for (method_name, source) in snippets {
            let syntax_valid = is_valid_method_snippet(&source, &method_name);
            if !syntax_valid {
                tracing::debug!(
                    agent = agent_index,
                    method = %method_name,
                    "rejecting syntactically invalid candidate"
                );
            }
            let Some(key) = method_names.iter().find(|m| **m == method_name) else {
                continue;
            };
            by_method.entry(key.as_str()).or_default().push(CandidateSnippet {
                method_name,
                source,
                agent_index,
                syntax_valid,
            });
        }
    }

    let mut selection = Selection {
        attempts_per_agent,
        ..Selection::default()
    };

    // Iterate in target order so the rng is consumed reproducibly.
    for method in method_names {
        let Some(candidates) = by_method.remove(method.as_str()) else {
            continue;
        };
        let valid: Vec<&CandidateSnippet> = candidates.iter().filter(|c| c.syntax_valid).collect();
        if let Some(chosen) = valid.choose(rng) {
            selection.selected.insert(method.clone(), (*chosen).clone());
        }
        selection.candidates.extend(candidates);
    }

    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partition_limits_what_each_agent_contributes() {
        let texts = [
            "def foo(self):\n    return 'a'\n\ndef bar(self):\n    return 'a'\n",
            "def foo(self):\n    return 'b'\n\ndef bar(self):\n    return 'b'\n",
        ];
        let partition = BTreeMap::from([("foo".to_string(), 0), ("bar".to_string(), 1)]);
        let visibility = Visibility::Partition(partition);

        let selection = select(
            &texts,
            &names(&["foo", "bar"]),
            &visibility,
            &mut StdRng::seed_from_u64(7),
        )
        .unwrap();

        assert_eq!(selection.attempts_per_agent, vec![1, 1]);
        assert_eq!(selection.selected["foo"].agent_index, 0);
        assert_eq!(selection.selected["bar"].agent_index, 1);
    }

    #[test]
    fn test_invalid_candidate_never_beats_valid_one() {
        let texts = [
            "def foo(self)\n    return 1\n",
            "```python\ndef foo(self):\n    return 2\n```\n",
        ];
        for seed in 0..32 {
            let selection = select(
                &texts,
                &names(&["foo"]),
                &Visibility::SelfSelect,
                &mut StdRng::seed_from_u64(seed),
            )
            .unwrap();
            let chosen = &selection.selected["foo"];
            assert_eq!(chosen.agent_index, 1);
            assert!(chosen.syntax_valid);
            assert_eq!(selection.invalid_candidates(), 1);
        }
    }

    #[test]
    fn test_all_invalid_leaves_method_unselected() {
        let texts = ["def foo(self):\n    return (\n"];
        let selection = select(
            &texts,
            &names(&["foo"]),
            &Visibility::SelfSelect,
            &mut StepRng::new(0, 1),
        )
        .unwrap();
        assert!(selection.selected.is_empty());
        assert_eq!(selection.candidates.len(), 1);
        assert_eq!(selection.attempts_per_agent, vec![1]);
    }

    #[test]
    fn test_partition_index_out_of_range_is_configuration_error() {
        let partition = BTreeMap::from([("foo".to_string(), 3)]);
        let err = select(
            &["def foo(self):\n    pass\n"],
            &names(&["foo"]),
            &Visibility::Partition(partition),
            &mut StepRng::new(0, 1),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::PartitionOutOfRange { agent: 3, agents: 1, .. }
        ));
    }

    #[test]
    fn test_visibility_from_parts() {
        let partition = BTreeMap::from([("foo".to_string(), 0)]);
        assert_eq!(
            Visibility::from_parts(Some(partition.clone()), true),
            Visibility::SelfSelect
        );
        assert_eq!(
            Visibility::from_parts(Some(partition.clone()), false),
            Visibility::Partition(partition)
        );
        assert_eq!(Visibility::from_parts(None, false), Visibility::SelfSelect);
    }

    proptest! {
        #[test]
        fn property_unique_valid_candidate_always_selected(seed in any::<u64>(), valid_agent in 0usize..4) {
            let texts: Vec<String> = (0..4)
                .map(|agent| {
                    if agent == valid_agent {
                        format!("def foo(self):\n    return {}\n", agent)
                    } else {
                        "def foo(self:\n    return\n".to_string()
                    }
                })
                .collect();
            let selection = select(
                &texts,
                &names(&["foo"]),
                &Visibility::SelfSelect,
                &mut StdRng::seed_from_u64(seed),
            )
            .unwrap();
            prop_assert_eq!(selection.selected["foo"].agent_index, valid_agent);
        }
    }
}
