//! querygate - safety-gated natural-language SQL.

mod cli;
mod logging;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use cli::{AskArgs, Cli, Command, EnqueueArgs};
use logging::LogSink;
use querygate::config::Config;
use querygate::db::{self, ExecutionGateway};
use querygate::language::Language;
use querygate::llm::create_generator;
use querygate::persistence::{HistoryStore, NewJob, StateDb};
use querygate::pipeline::{ExecutionOutcome, Pipeline, PipelineOptions, SubmitRequest};
use querygate::worker::{JobDrainer, LogNotifier};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    logging::init(if cli.log_file { LogSink::File } else { LogSink::Stderr });

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply_to(&mut config)?;

    let state_path = config.state.resolved_path();
    let state = StateDb::open(&state_path)
        .await
        .with_context(|| format!("Failed to open state database {}", state_path.display()))?;

    let result = match cli.command {
        Command::Ask(args) => ask(&config, &state, args).await,
        Command::Enqueue(args) => enqueue(&config, &state, args).await,
        Command::Worker { once } => work(&config, &state, once).await,
        Command::History { limit } => print_history(&state, limit).await,
        Command::Jobs { limit } => print_jobs(&state, limit).await,
    };

    state.close().await;
    result
}

/// Connects to the target database and wires the pipeline.
async fn build_pipeline(config: &Config, state: &StateDb) -> Result<Pipeline> {
    let database = db::connect(&config.database, &config.execution)
        .await
        .with_context(|| format!("Failed to connect to {}", config.database.display_string()))?;
    let generator = create_generator(&config.generation)?;

    Ok(Pipeline::new(
        generator,
        ExecutionGateway::new(database),
        Arc::new(state.history()),
        PipelineOptions::from_config(config),
    ))
}

async fn ask(config: &Config, state: &StateDb, args: AskArgs) -> Result<()> {
    let pipeline = build_pipeline(config, state).await?;

    let mut request = SubmitRequest::new(&args.question).execute_immediately();
    if let Some(actor) = &args.actor {
        request = request.with_actor(actor);
    }
    let submission = pipeline.submit(request).await?;
    let query = &submission.query;

    println!("SQL:    {}", query.sql);
    println!("Type:   {} ({} risk)", query.kind, query.risk);
    println!("Impact: {}", query.estimated_impact);
    if !query.explanation.is_empty() {
        println!("About:  {}", query.explanation);
    }
    for warning in &query.warnings {
        println!("Warning: {}", warning);
    }

    if let Some(outcome) = &submission.outcome {
        print_outcome(outcome)?;
        return Ok(());
    }

    if !query.requires_confirmation {
        let outcome = pipeline.execute(query.id, false).await?;
        return print_outcome(&outcome);
    }

    if args.preview && query.kind.is_write() {
        let preview = pipeline.preview(query.id).await?;
        println!("Would affect {} rows", preview.affected_rows);
        for row in &preview.sample_rows {
            println!("  {}", serde_json::to_string(row)?);
        }
        for warning in &preview.warnings {
            println!("Warning: {}", warning);
        }
    }

    let yes = args.yes || prompt_confirmation().await?;
    match pipeline.confirm(query.id, yes).await? {
        Some(outcome) => print_outcome(&outcome),
        None => {
            println!("Cancelled.");
            Ok(())
        }
    }
}

async fn prompt_confirmation() -> Result<bool> {
    print!("Execute this statement? [y/N] ");
    std::io::stdout().flush()?;

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .context("Confirmation prompt failed")??;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_outcome(outcome: &ExecutionOutcome) -> Result<()> {
    if !outcome.success {
        anyhow::bail!("{}", outcome.message);
    }
    if let Some(rows) = &outcome.rows {
        for row in rows {
            println!("{}", serde_json::to_string(row)?);
        }
    }
    println!("{} ({} ms)", outcome.message, outcome.elapsed_ms);
    Ok(())
}

async fn enqueue(config: &Config, state: &StateDb, args: EnqueueArgs) -> Result<()> {
    let language = match &args.language {
        Some(tag) => tag.parse::<Language>().map_err(anyhow::Error::msg)?,
        None => match Language::detect(&args.question) {
            Language::He => Language::He,
            Language::En => config
                .generation
                .default_language
                .parse()
                .unwrap_or_default(),
        },
    };

    let mut job = NewJob::new(&args.question)
        .with_environment(
            args.environment
                .as_deref()
                .unwrap_or(&config.worker.environment),
        )
        .with_language(language.as_str());
    if let Some(actor) = &args.actor {
        job = job.with_actor(actor);
    }

    let id = state.jobs().enqueue(&job).await?;
    println!("{}", id);
    Ok(())
}

async fn work(config: &Config, state: &StateDb, once: bool) -> Result<()> {
    let pipeline = build_pipeline(config, state).await?;
    let drainer = JobDrainer::new(Arc::new(pipeline), state.jobs(), Arc::new(LogNotifier))
        .with_config(&config.worker);

    if once {
        let summary = drainer.drain_once().await?;
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current batch");
            on_signal.cancel();
        }
    });

    drainer.run(cancel).await;
    Ok(())
}

async fn print_history(state: &StateDb, limit: usize) -> Result<()> {
    let history = state.history();
    for entry in history.recent(limit).await? {
        let status = match (entry.executed, entry.success) {
            (false, _) => "pending",
            (true, Some(true)) => "ok",
            (true, _) => "failed",
        };
        println!(
            "{}  {:<7} {:<11} {:<8} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            status,
            entry.kind.as_str(),
            entry.risk.as_str(),
            entry.sql
        );
    }
    Ok(())
}

async fn print_jobs(state: &StateDb, limit: usize) -> Result<()> {
    for job in state.jobs().list(limit).await? {
        println!(
            "{}  {}  {:<10} {:<8} {}",
            job.id,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.status.as_str(),
            job.environment,
            job.question
        );
        if let Some(response) = &job.response {
            println!("    {}", response);
        }
    }
    Ok(())
}
