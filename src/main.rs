use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use splice_reward::{
    attribute_tests_to_methods, extract_snippets, score_round, Config, PythonExecutor, ScoringTask,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "splice-reward",
    about = "Merge multi-agent method completions into a class and score the result",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Score one round of agent completions against a task file
    Score(ScoreArgs),
    /// Print the method snippets found in a completion
    Extract(ExtractArgs),
    /// Print which target methods each test calls
    Attribute(AttributeArgs),
}

#[derive(Args, Debug)]
struct ScoreArgs {
    /// Task definition (TOML)
    #[arg(long)]
    task: PathBuf,
    /// One completion file per agent, in agent order
    #[arg(long = "agent", required = true)]
    agents: Vec<PathBuf>,
    /// Seed for candidate tie-breaking (overrides the config)
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    methods: Vec<String>,
    file: PathBuf,
}

#[derive(Args, Debug)]
struct AttributeArgs {
    #[arg(long = "class")]
    class_name: String,
    #[arg(long, value_delimiter = ',', required = true)]
    methods: Vec<String>,
    file: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Score(args) => run_score(args),
        Commands::Extract(args) => {
            let text = read(&args.file)?;
            print_json(&extract_snippets(&text, &args.methods))
        }
        Commands::Attribute(args) => {
            let source = read(&args.file)?;
            print_json(&attribute_tests_to_methods(
                &source,
                &args.methods,
                &args.class_name,
            ))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SPLICE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_score(args: ScoreArgs) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let task: ScoringTask = toml::from_str(&read(&args.task)?)
        .with_context(|| format!("Failed to parse task {}", args.task.display()))?;
    let agent_texts = args
        .agents
        .iter()
        .map(|path| read(path))
        .collect::<Result<Vec<_>>>()?;

    let python = &config.sandbox.python;
    if !Path::new(python).is_file() && !splice_reward::util::program_available_on_path(python) {
        eprintln!(
            "  Warning: {} not found on PATH; every test will be recorded as an error.",
            python
        );
    }
    let executor = PythonExecutor::new(python.clone());

    let score = match args.seed.or(config.seed) {
        Some(seed) => score_round(
            &task,
            &agent_texts,
            &config,
            &executor,
            &mut StdRng::seed_from_u64(seed),
        ),
        None => score_round(
            &task,
            &agent_texts,
            &config,
            &executor,
            &mut rand::thread_rng(),
        ),
    }
    .map_err(|e| anyhow!("Task {} is misconfigured: {}", args.task.display(), e))?;

    print_json(&score)
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
