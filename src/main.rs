mod agent;
mod config;
mod db;
mod error;
mod memory;
mod orchestrator;
mod tools;
mod types;

use std::io::{BufRead, Write};

use anyhow::{Context, Result, anyhow};
use crossterm::style::Stylize;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use agent::AgentContext;
use agent::provider::{LlmBackend, build_http_client};
use config::RunnerConfig;
use db::executor::SqlExecutor;
use db::reader::SchemaReader;
use error::TaskError;
use memory::store::KeyValueStore;
use orchestrator::{Orchestrator, TaskOutcome};

// ── CLI surface ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Interactive,
    Batch,
    Evaluation,
}

#[derive(Debug, Default)]
struct CliArgs {
    mode: Option<Mode>,
    db: Option<String>,
    dataset: Option<String>,
    data_path: Option<String>,
    tables_json: Option<String>,
    input: Option<String>,
    output: Option<String>,
    limit: Option<usize>,
    max_steps: Option<usize>,
    timeout_secs: Option<u64>,
    query: Option<String>,
    evidence: Option<String>,
}

/// One item of a batch/evaluation input file. BIRD uses `SQL` for gold.
#[derive(Debug, Deserialize)]
struct BatchItem {
    question: String,
    db_id: String,
    #[serde(default)]
    evidence: Option<String>,
    #[serde(rename = "SQL", default)]
    gold_sql: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SQLTREE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<TaskError>() {
        Some(task_error) => task_error.exit_code(),
        None => 2,
    }
}

async fn run() -> Result<()> {
    let args = parse_cli_args(std::env::args().skip(1).collect())?;
    let Some(mode) = args.mode else {
        print_usage();
        return Err(TaskError::Input("no mode given".into()).into());
    };

    let mut config = RunnerConfig::load()?;
    if let Some(dataset) = &args.dataset {
        config.dataset = dataset.clone();
    }
    if let Some(data_path) = &args.data_path {
        config.data_path = data_path.clone();
    }
    if let Some(tables_json) = &args.tables_json {
        config.tables_json = tables_json.clone();
    }
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    if let Some(timeout) = args.timeout_secs {
        config.time_limit_secs = timeout;
    }

    let mut backend = LlmBackend::from_env();
    if let Some(model) = &config.model {
        backend = backend.with_model(model);
    }
    if backend.api_key_missing() {
        return Err(TaskError::Input(format!(
            "{} is not set; the core needs exactly that one credential",
            backend.required_key_name()
        ))
        .into());
    }
    let http = build_http_client()?;

    match mode {
        Mode::Interactive => run_interactive(&args, &config, backend, http).await,
        Mode::Batch => run_batch(&args, &config, backend, http, false).await,
        Mode::Evaluation => run_batch(&args, &config, backend, http, true).await,
    }
}

/// One task, one fresh memory: the store is per-task and vanishes with it.
async fn process_one(
    config: &RunnerConfig,
    backend: &LlmBackend,
    http: &reqwest::Client,
    question: &str,
    db_id: &str,
    evidence: Option<&str>,
) -> Result<TaskOutcome> {
    let executor = SqlExecutor::new(&config.data_path).with_timeout(config.query_timeout());
    let ctx = AgentContext {
        store: KeyValueStore::new(),
        backend: backend.clone(),
        http: http.clone(),
        executor,
    };
    let reader = SchemaReader::new(
        &config.data_path,
        &config.tables_json,
        &config.dataset,
        config.lazy_schema,
    );
    let orchestrator = Orchestrator::new(ctx, config.orchestrator_config());
    orchestrator
        .process_query(question, db_id, None, evidence, &reader)
        .await
}

// ── Interactive mode ──────────────────────────────────────────────────────────

async fn run_interactive(
    args: &CliArgs,
    config: &RunnerConfig,
    backend: LlmBackend,
    http: reqwest::Client,
) -> Result<()> {
    let db = args
        .db
        .clone()
        .ok_or_else(|| anyhow!(TaskError::Input("interactive mode needs --db".into())))?;

    println!(
        "{} dataset={} db={} model={}",
        "sqltree".bold().green(),
        config.dataset,
        db,
        backend.model_name()
    );
    println!("{}", "Type a question, or 'exit' to quit.".dark_grey());

    // One-shot question via -q skips the REPL.
    if let Some(question) = &args.query {
        let outcome =
            process_one(config, &backend, &http, question, &db, args.evidence.as_deref()).await?;
        print_outcome(&outcome);
        return Ok(());
    }

    let stdin = std::io::stdin();
    loop {
        print!("{} ", "❯".green());
        std::io::stdout().flush()?;
        let Some(line) = stdin.lock().lines().next() else {
            break;
        };
        let question = line?.trim().to_string();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }
        match process_one(config, &backend, &http, &question, &db, None).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => eprintln!("{} {e:#}", "task failed:".red()),
        }
    }
    Ok(())
}

fn print_outcome(outcome: &TaskOutcome) {
    match &outcome.final_sql {
        Some(sql) => {
            println!("{}", "SQL:".bold());
            println!("  {sql}");
            let quality = outcome
                .quality
                .map(|q| format!("{q:?}").to_lowercase())
                .unwrap_or_else(|| "unknown".to_string());
            let line = format!(
                "quality={} steps={} elapsed={:.1}s{}",
                quality,
                outcome.steps,
                outcome.elapsed.as_secs_f64(),
                if outcome.budget_exhausted {
                    " (budget exhausted)"
                } else {
                    ""
                }
            );
            println!("{}", line.dark_grey());
        }
        None => println!("{}", "no SQL produced".red()),
    }
}

// ── Batch and evaluation modes ────────────────────────────────────────────────

async fn run_batch(
    args: &CliArgs,
    config: &RunnerConfig,
    backend: LlmBackend,
    http: reqwest::Client,
    evaluate: bool,
) -> Result<()> {
    let input_path = args
        .input
        .clone()
        .ok_or_else(|| anyhow!(TaskError::Input("batch mode needs --input".into())))?;
    let raw = std::fs::read_to_string(&input_path)
        .with_context(|| format!("reading {input_path}"))?;
    let mut items: Vec<BatchItem> =
        serde_json::from_str(&raw).context("input file is not a JSON array of questions")?;
    if let Some(limit) = args.limit {
        items.truncate(limit);
    }

    let executor = SqlExecutor::new(&config.data_path).with_timeout(config.query_timeout());
    let mut results = Vec::new();
    let mut matches = 0usize;
    let mut executed = 0usize;

    for (i, item) in items.iter().enumerate() {
        tracing::info!(index = i, db = %item.db_id, "processing question");
        let outcome = match process_one(
            config,
            &backend,
            &http,
            &item.question,
            &item.db_id,
            item.evidence.as_deref(),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(index = i, error = %e, "task failed");
                results.push(json!({
                    "index": i,
                    "question": item.question,
                    "db_id": item.db_id,
                    "error": format!("{e:#}"),
                }));
                continue;
            }
        };

        let mut record = outcome.to_json();
        record["index"] = json!(i);
        record["question"] = json!(item.question);
        record["db_id"] = json!(item.db_id);

        if evaluate && let Some(gold) = &item.gold_sql {
            let verdict = execution_match(&executor, &outcome, gold, &item.db_id).await;
            if let Some(matched) = verdict {
                executed += 1;
                if matched {
                    matches += 1;
                }
                record["execution_match"] = json!(matched);
            }
        }
        results.push(record);
    }

    let mut report = json!({"results": results, "total": items.len()});
    if evaluate && executed > 0 {
        report["execution_accuracy"] = json!(matches as f64 / executed as f64);
        report["compared"] = json!(executed);
    }

    let rendered = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("writing {path}"))?;
            println!("wrote {} results to {path}", items.len());
        }
        None => println!("{rendered}"),
    }
    if evaluate && executed > 0 {
        println!(
            "execution match: {matches}/{executed} ({:.1}%)",
            100.0 * matches as f64 / executed as f64
        );
    }
    Ok(())
}

/// Row-set comparison of predicted vs gold SQL, ignoring row order.
async fn execution_match(
    executor: &SqlExecutor,
    outcome: &TaskOutcome,
    gold_sql: &str,
    db_id: &str,
) -> Option<bool> {
    let predicted_sql = outcome.final_sql.as_deref()?;
    let predicted = executor.execute(predicted_sql, db_id).await.ok()?;
    let gold = executor.execute(gold_sql, db_id).await.ok()?;
    if predicted.error.is_some() || gold.error.is_some() {
        return Some(false);
    }
    let mut left: Vec<String> = predicted.data.iter().map(|r| r.to_string()).collect();
    let mut right: Vec<String> = gold.data.iter().map(|r| r.to_string()).collect();
    left.sort();
    right.sort();
    Some(left == right && predicted.row_count == gold.row_count)
}

// ── Argument parsing ──────────────────────────────────────────────────────────

fn parse_cli_args(args: Vec<String>) -> Result<CliArgs> {
    fn value_of(args: &[String], i: usize) -> Result<String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| anyhow!(TaskError::Input(format!("{} needs a value", args[i]))))
    }
    fn number_of<T: std::str::FromStr>(args: &[String], i: usize) -> Result<T> {
        value_of(args, i)?
            .parse()
            .map_err(|_| anyhow!(TaskError::Input(format!("{} needs a number", args[i]))))
    }

    let mut out = CliArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "interactive" => out.mode = Some(Mode::Interactive),
            "batch" => out.mode = Some(Mode::Batch),
            "evaluation" => out.mode = Some(Mode::Evaluation),
            "--db" => {
                out.db = Some(value_of(&args, i)?);
                i += 1;
            }
            "--dataset" => {
                out.dataset = Some(value_of(&args, i)?);
                i += 1;
            }
            "--data-path" => {
                out.data_path = Some(value_of(&args, i)?);
                i += 1;
            }
            "--tables-json" => {
                out.tables_json = Some(value_of(&args, i)?);
                i += 1;
            }
            "--input" => {
                out.input = Some(value_of(&args, i)?);
                i += 1;
            }
            "--output" => {
                out.output = Some(value_of(&args, i)?);
                i += 1;
            }
            "--evidence" => {
                out.evidence = Some(value_of(&args, i)?);
                i += 1;
            }
            "-q" | "--query" => {
                out.query = Some(value_of(&args, i)?);
                i += 1;
            }
            "--limit" => {
                out.limit = Some(number_of(&args, i)?);
                i += 1;
            }
            "--max-steps" => {
                out.max_steps = Some(number_of(&args, i)?);
                i += 1;
            }
            "--timeout" => {
                out.timeout_secs = Some(number_of(&args, i)?);
                i += 1;
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                return Err(TaskError::Input(format!("unknown argument '{other}'")).into());
            }
        }
        i += 1;
    }
    Ok(out)
}

fn print_usage() {
    println!(
        "usage: sqltree <interactive|batch|evaluation> [options]\n\
         \n\
         options:\n\
           --db <name>           database id (interactive mode)\n\
           --dataset <name>      dataset name (default: bird)\n\
           --data-path <dir>     directory holding <db>/<db>.sqlite files\n\
           --tables-json <file>  dataset tables.json\n\
           --input <file>        JSON array of questions (batch/evaluation)\n\
           --output <file>       where to write results JSON\n\
           --limit <n>           process at most n questions\n\
           --max-steps <n>       orchestrator step budget (default 50)\n\
           --timeout <secs>      task wall-clock budget (default 300)\n\
           -q, --query <text>    one-shot question (interactive mode)\n\
           --evidence <text>     hint passed with -q"
    );
}
