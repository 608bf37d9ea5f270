use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use toolwerk::{
    load_suite,
    providers::openai::OpenAI,
    Engine,
    EngineConfig,
    EvalRequest,
    InMemorySuiteStore,
    JobEvent,
    LLMProvider,
    LlmMetaModel,
    ParamTuningRequest,
    ParamValue,
    PromptTuningRequest,
    RequestParams,
    RunOutcome,
    SearchSpace,
    SearchStrategy,
    TuningMode,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "toolwerk")]
#[command(about = "Evaluate and tune tool-calling behavior of LLMs")]
struct Cli {
    /// Suite file (YAML/JSON)
    #[arg(long, global = true, default_value = "suites/default.yaml")]
    suite: PathBuf,

    /// Engine config file (YAML/JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model identifier; repeat to compare several models
    #[arg(long = "model", global = true)]
    models: Vec<String>,

    /// System prompt used by the models under test
    #[arg(long, global = true)]
    system_prompt: Option<String>,

    /// Fixed request parameter, `name=value` (repeatable)
    #[arg(long = "param", global = true)]
    params: Vec<String>,

    /// Output path for the final run record (JSON)
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score every case against every model once
    Eval,
    /// Search request parameters
    TuneParams(TuneParamsArgs),
    /// Evolve the system prompt with a meta-model
    TunePrompt(TunePromptArgs),
}

#[derive(Debug, Clone, ValueEnum)]
enum StrategyKind {
    Grid,
    Random,
    Bayesian,
}

#[derive(Args)]
struct TuneParamsArgs {
    /// Search space file (YAML/JSON)
    #[arg(long)]
    space: PathBuf,

    #[arg(long, value_enum, default_value = "grid")]
    strategy: StrategyKind,

    /// Samples for random search, trials for Bayesian search
    #[arg(long, default_value_t = 20)]
    budget: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args)]
struct TunePromptArgs {
    /// Prompt the first generation is derived from
    #[arg(long)]
    base_prompt: Option<String>,

    #[arg(long, default_value_t = 5)]
    population: usize,

    /// Generations to evolve; 1 scores a single population
    #[arg(long, default_value_t = 1)]
    generations: usize,

    #[arg(long, default_value_t = 0.4)]
    selection_ratio: f64,

    /// Model that writes the prompt variants
    #[arg(long, default_value = "gpt-4o-mini")]
    meta_model: String,

    #[arg(long)]
    instructions: Option<String>,

    /// Library name for the winning prompt
    #[arg(long)]
    save_as: Option<String>,
}

fn default_system_prompt() -> &'static str {
    "You are a careful tool-calling assistant.\n\
Follow tool JSON schemas exactly.\n\
Call tools only when the request requires them."
}

fn parse_value(raw: &str) -> ParamValue {
    if let Ok(value) = raw.parse::<bool>() {
        return ParamValue::from(value);
    }
    if let Ok(value) = raw.parse::<i64>() {
        return ParamValue::from(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        return ParamValue::from(value);
    }
    ParamValue::from(raw)
}

fn parse_params(raw: &[String]) -> Result<RequestParams, String> {
    raw.iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected name=value, got `{pair}`"))?;
            Ok((name.trim().to_string(), parse_value(value.trim())))
        })
        .collect()
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn default_out_path() -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    PathBuf::from(format!("runs/{ts}.json"))
}

fn load_space(path: &Path) -> Result<SearchSpace, Box<dyn std::error::Error>> {
    let raw = fs::read_to_string(path)?;
    if path.extension().and_then(|s| s.to_str()) == Some("json") {
        Ok(serde_json::from_str(&raw)?)
    } else {
        Ok(serde_yaml::from_str(&raw)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,toolwerk=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if cli.models.is_empty() {
        eprintln!("At least one --model is required.");
        std::process::exit(2);
    }

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides();

    let suite = load_suite(&cli.suite)?;
    let suite_id = suite.id.clone();
    let suites = InMemorySuiteStore::new();
    suites.insert(suite).await;

    let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_env()?);
    let mut builder = Engine::builder(provider.clone(), Arc::new(suites)).with_config(config);
    if let Command::TunePrompt(args) = &cli.command {
        builder = builder.with_meta_model(Arc::new(LlmMetaModel::new(provider.clone(), args.meta_model.clone())));
    }
    let engine = builder.build();

    let params = parse_params(&cli.params)?;
    let system_prompt = cli
        .system_prompt
        .clone()
        .unwrap_or_else(|| default_system_prompt().to_string());

    let run_id = match &cli.command {
        Command::Eval => {
            let request = EvalRequest::new(suite_id.clone(), cli.models.clone())
                .with_system_prompt(system_prompt)
                .with_params(params);
            engine.start_eval(&suite_id, request).await?
        }
        Command::TuneParams(args) => {
            let space = load_space(&args.space)?;
            let strategy = match args.strategy {
                StrategyKind::Grid => SearchStrategy::Grid,
                StrategyKind::Random => SearchStrategy::Random {
                    n_samples: args.budget,
                    seed: args.seed,
                },
                StrategyKind::Bayesian => SearchStrategy::Bayesian {
                    n_trials: args.budget,
                    seed: args.seed,
                    settings: None,
                },
            };
            let request = ParamTuningRequest::new(suite_id.clone(), cli.models.clone(), space, strategy)
                .with_system_prompt(system_prompt)
                .with_base_params(params);
            engine.start_param_tuning(&suite_id, request).await?
        }
        Command::TunePrompt(args) => {
            let mode = if args.generations > 1 {
                TuningMode::Evolutionary {
                    generations: args.generations,
                    selection_ratio: args.selection_ratio,
                }
            } else {
                TuningMode::Quick
            };
            let base_prompt = args.base_prompt.clone().unwrap_or(system_prompt);
            let mut request =
                PromptTuningRequest::new(suite_id.clone(), cli.models.clone(), base_prompt, args.population, mode);
            request.params = params;
            request.instructions = args.instructions.clone();
            request.save_as = args.save_as.clone();
            engine.start_prompt_tuning(&suite_id, request).await?
        }
    };

    follow(&engine, run_id).await?;

    let run = engine.get_run(run_id).await?;
    let out_path = cli.out.clone().unwrap_or_else(default_out_path);
    ensure_parent_dir(&out_path)?;
    fs::write(&out_path, serde_json::to_vec_pretty(&run)?)?;
    eprintln!("Run {run_id} ({:?}) written to {}", run.status, out_path.display());

    match &run.outcome {
        Some(RunOutcome::Eval(summary)) => summary.print(),
        Some(RunOutcome::ParamTuning(outcome)) => {
            println!(
                "{} search: {}/{} combos evaluated{}",
                outcome.strategy,
                outcome.evaluated,
                outcome.planned,
                if outcome.converged { ", converged" } else { "" }
            );
            if let Some(best) = &outcome.best {
                println!("  best: {} on {} (score {:.3})", best.combo, best.model, best.score);
            }
        }
        Some(RunOutcome::PromptTuning(outcome)) => {
            println!(
                "{} prompt tuning: {} generations, means {:?}",
                outcome.mode, outcome.generations_run, outcome.generation_means
            );
            if let Some(reason) = &outcome.stopped_early {
                println!("  stopped early: {reason}");
            }
            if let Some(best) = &outcome.best {
                println!("  best (score {:.3}, generation {}):\n{}", best.score, best.generation, best.text);
            }
        }
        None => {
            if let Some(error) = &run.error {
                eprintln!("Run failed: {error}");
            }
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn follow(engine: &Engine, run_id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = engine.subscribe(run_id, 0).await?;
    while let Some(envelope) = events.next().await {
        match &envelope.event {
            JobEvent::Init { total, description } => eprintln!("[{}] {description} ({total} evaluations)", envelope.seq),
            JobEvent::Progress { fraction, activity, .. } => {
                eprintln!("[{}] {:>5.1}% {activity}", envelope.seq, fraction * 100.0)
            }
            JobEvent::ItemResult { item } => eprintln!("[{}] result {}", envelope.seq, item.key()),
            JobEvent::Failed { error, .. } => eprintln!("[{}] failed: {error}", envelope.seq),
            other => eprintln!("[{}] {}", envelope.seq, other.name()),
        }
    }
    Ok(())
}
