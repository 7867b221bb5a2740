//! splice-reward library crate
//!
//! Turns a round of raw agent completions into a merged Python module and a
//! composite reward. Exposed as a library so trainers and benchmarks can
//! call the scoring core without going through the CLI.

pub mod attribution;
pub mod config;
pub mod error;
pub mod extract;
pub mod merge;
pub mod pipeline;
pub mod python;
pub mod reward;
pub mod sandbox;
pub mod skeleton;
pub mod util;

pub use attribution::{attribute_tests_to_methods, discover_tests};
pub use config::Config;
pub use error::ConfigurationError;
pub use extract::extract_snippets;
pub use merge::{merge, select, select_and_merge, Visibility};
pub use pipeline::{score_batch, score_round, RoundScore, ScoringTask};
pub use reward::{compute_reward, BalanceScore, BalanceStrategy, RewardConfig, RewardInputs, RewardVector};
pub use sandbox::{run_tests, Executor, PythonExecutor, TestOutcome, TestRunResult};
pub use skeleton::Skeleton;
