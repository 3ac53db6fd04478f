//! FlowRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner workflow.yaml
//!
//! # With a JSON trigger payload and a fixed execution ID
//! flowrunner workflow.yaml --payload event.json --execution-id run-42
//!
//! # Make nested workflows available to subflow steps
//! flowrunner workflow.yaml --subflow enrich.yaml --subflow notify.yaml
//!
//! # Resume a paused execution from the state directory
//! flowrunner resume run-42 approve --decision decision.json
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::Value;

use flowrunner::execution::{
    make_decision_topic, ExecutionStatus, ExecutionSummary, UserContext, WorkflowEngine,
};
use flowrunner::workflow::parser::load_workflow;
use flowrunner::workflow::FileStore;
use flowrunner::{EngineConfig, StepRegistry, APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// What the invocation asks for.
#[derive(Debug)]
enum Command {
    Run,
    Resume {
        execution_id: String,
        step_id: String,
        decision_path: Option<String>,
    },
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    workflow_path: String,
    payload_path: Option<String>,
    execution_id: Option<String>,
    subflow_paths: Vec<String>,
    state_dir: Option<PathBuf>,
    max_parallel: Option<usize>,
    step_timeout_secs: Option<f64>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: Command::Run,
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            payload_path: None,
            execution_id: None,
            subflow_paths: Vec::new(),
            state_dir: None,
            max_parallel: None,
            step_timeout_secs: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!("       flowrunner resume <EXECUTION_ID> <STEP_ID> [--decision FILE] [OPTIONS]");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to workflow YAML or JSON file");
    println!("  <EXECUTION_ID>        Paused execution saved in the state directory");
    println!("  <STEP_ID>             Step awaiting a decision");
    println!();
    println!("Options:");
    println!("  --payload FILE        JSON trigger payload");
    println!("  --execution-id ID     Execution ID (default: generated)");
    println!("  --subflow FILE        Workflow available to subflow steps (repeatable)");
    println!("  --decision FILE       JSON decision for resume (default: {{}})");
    println!("  --state-dir DIR       Directory for execution state files");
    println!("  --parallel N          Maximum concurrently running steps");
    println!("  --timeout SECS        Default step timeout");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner pipeline.yaml");
    println!("  flowrunner pipeline.yaml --payload event.json --parallel 8");
    println!("  flowrunner resume 3f2c9a1e approve --decision approved.json");
}

/// Returns the value following a flag.
fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a String, String> {
    *i += 1;
    args.get(*i)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positionals: Vec<String> = Vec::new();
    let mut decision_path = None;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--payload" => {
                config.payload_path = Some(flag_value(args, &mut i, arg)?.clone());
            }
            "--execution-id" => {
                config.execution_id = Some(flag_value(args, &mut i, arg)?.clone());
            }
            "--subflow" => {
                config.subflow_paths.push(flag_value(args, &mut i, arg)?.clone());
            }
            "--decision" => {
                decision_path = Some(flag_value(args, &mut i, arg)?.clone());
            }
            "--state-dir" => {
                config.state_dir = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--parallel" => {
                let value = flag_value(args, &mut i, arg)?;
                let parallel: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if parallel == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                config.max_parallel = Some(parallel);
            }
            "--timeout" => {
                let value = flag_value(args, &mut i, arg)?;
                let secs: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout value: {}", value))?;
                if !(secs > 0.0 && secs.is_finite()) {
                    return Err(format!("Invalid timeout value: {}", value));
                }
                config.step_timeout_secs = Some(secs);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positionals.push(arg.clone()),
        }
        i += 1;
    }

    match positionals.first().map(String::as_str) {
        Some("resume") => {
            let [_, execution_id, step_id] = positionals.as_slice() else {
                return Err("resume requires <EXECUTION_ID> and <STEP_ID>".to_string());
            };
            config.command = Command::Resume {
                execution_id: execution_id.clone(),
                step_id: step_id.clone(),
                decision_path,
            };
        }
        _ => {
            if decision_path.is_some() {
                return Err("--decision is only valid with resume".to_string());
            }
            match positionals.as_slice() {
                [] => {}
                [path] => config.workflow_path = path.clone(),
                [_, extra, ..] => return Err(format!("Unexpected argument: {}", extra)),
            }
        }
    }

    Ok(config)
}

/// Reads a JSON document from disk.
fn read_json(path: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Could not read '{}': {}", path, e))?;
    let value = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid JSON in '{}': {}", path, e))?;
    Ok(value)
}

/// Builds the engine configuration: environment first, then flags.
fn engine_config(config: &Config) -> EngineConfig {
    let mut engine_config = EngineConfig::from_env();

    if let Some(parallel) = config.max_parallel {
        engine_config = engine_config.with_max_concurrent_steps(parallel);
    }
    if let Some(secs) = config.step_timeout_secs {
        engine_config = engine_config.with_default_step_timeout(Duration::from_secs_f64(secs));
    }
    if let Some(ref dir) = config.state_dir {
        engine_config = engine_config.with_state_dir(dir.clone());
    }
    engine_config
}

/// Identity attached to executions started from the command line.
fn cli_user() -> UserContext {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .map(UserContext::new)
        .unwrap_or_default()
}

/// Prints the summary, timeline and any pending decision topics.
async fn report(
    engine: &WorkflowEngine,
    summary: &ExecutionSummary,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = engine.get_execution(&summary.execution_id).await?;

    println!();
    println!("Execution:  {}", summary.execution_id);
    println!("Workflow:   {}", summary.workflow_id);
    println!("Status:     {}", summary.status);
    println!(
        "Steps:      {} total, {} succeeded, {} failed, {} skipped, {} pending",
        summary.total_steps,
        summary.succeeded_steps,
        summary.failed_steps,
        summary.skipped_steps,
        summary.pending_steps
    );
    println!("Waves:      {}", summary.waves);
    if let Some(ms) = summary.duration_ms {
        println!("Duration:   {:.2}s", ms as f64 / 1000.0);
    }
    if let Some(ref message) = summary.error_message {
        println!("Error:      {}", message);
    }

    if !context.timeline.get_events().is_empty() {
        println!();
        println!("{}", context.timeline.gantt_chart());
    }

    if summary.status == ExecutionStatus::Paused {
        println!();
        println!("Awaiting decisions:");
        for step_id in &summary.awaiting_steps {
            println!(
                "  {}  (topic: {})",
                step_id,
                make_decision_topic(&summary.execution_id, step_id, None)
            );
            println!(
                "      resume with: flowrunner resume {} {} --decision FILE",
                summary.execution_id, step_id
            );
        }
    }

    match summary.status {
        ExecutionStatus::Completed | ExecutionStatus::Paused => Ok(()),
        status => Err(format!("Execution '{}' ended as {}", summary.execution_id, status).into()),
    }
}

async fn execute(config: Config, engine_config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::new(engine_config.state_dir.clone());
    info!("State directory: {}", store.dir().display());

    let engine = WorkflowEngine::builder()
        .registry(StepRegistry::with_builtins())
        .config(engine_config)
        .store(store)
        .build();

    for path in &config.subflow_paths {
        let workflow = load_workflow(path).map_err(|e| {
            error!("Failed to load subflow: {}", e);
            format!("Could not load subflow from '{}': {}", path, e)
        })?;
        engine.register_workflow(workflow)?;
    }

    let summary = match config.command {
        Command::Run => {
            info!("Loading workflow: {}", config.workflow_path);
            let workflow = load_workflow(&config.workflow_path).map_err(|e| {
                error!("Failed to load workflow: {}", e);
                format!(
                    "Could not load workflow from '{}': {}",
                    config.workflow_path, e
                )
            })?;
            info!(
                "Workflow loaded: '{}' with {} steps",
                workflow.workflow_id,
                workflow.steps.len()
            );

            let payload = match config.payload_path {
                Some(ref path) => read_json(path)?,
                None => Value::Null,
            };

            engine
                .execute(workflow, config.execution_id, payload, cli_user(), true)
                .await?
        }
        Command::Resume {
            execution_id,
            step_id,
            decision_path,
        } => {
            if config.execution_id.is_some() {
                warn!("--execution-id is ignored when resuming");
            }
            let decision = match decision_path {
                Some(ref path) => read_json(path)?,
                None => Value::Object(Default::default()),
            };

            info!("Resuming '{}' at step '{}'", execution_id, step_id);
            engine
                .try_resume(&execution_id, &step_id, decision, true)
                .await?
        }
    };

    report(&engine, &summary).await
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let engine_config = engine_config(&config);
    info!(
        "Worker pool: {} slots, wave width {}",
        engine_config.max_concurrent_steps, engine_config.max_wave_width
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(config, engine_config))
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
