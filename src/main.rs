use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use assistant_orchestrator::config::Config;
use assistant_orchestrator::memory::TracingMemorySink;
use assistant_orchestrator::pipeline::{PipelineContext, StepScheduler, StepValidator, SecurityPolicy};
use assistant_orchestrator::planning::{ExecutionPlan, PlanParser, ToolStep};
use assistant_orchestrator::router::ModelRouter;
use assistant_orchestrator::service::{PipelineService, Priority, SubmitOptions};
use assistant_orchestrator::tools::{DryRunExecutive, ToolRegistry};

/// How long `run` waits for in-flight work when it exits
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "assistant-orchestrator")]
#[command(about = "Plan, validate and schedule desktop-assistant tool calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a raw planner response and print the validated plan
    Plan {
        /// File holding the planner output, or "-" for stdin
        input: String,
        /// Also run the security gate and report dropped steps
        #[arg(long)]
        check: bool,
    },
    /// Run a request through the pipeline with a dry-run tool executive
    Run {
        /// The request text
        request: String,
        /// Queue priority: low, normal or high
        #[arg(short, long, default_value = "normal")]
        priority: Priority,
        /// Skip planning and run these steps, as tool:json-args
        #[arg(long = "step", value_parser = parse_step)]
        steps: Vec<ToolStep>,
        /// Let code-execution tools through
        #[arg(long)]
        allow_unsafe: bool,
        /// Working directory relative paths resolve against
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Show or initialize the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "assistant_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { input, check } => {
            show_plan(&input, check)?;
        }
        Commands::Run {
            request,
            priority,
            steps,
            allow_unsafe,
            cwd,
        } => {
            run_request(request, priority, steps, allow_unsafe, cwd).await?;
        }
        Commands::Config { show, init } => {
            handle_config(show, init)?;
        }
    }

    Ok(())
}

/// Parse `tool:{"json":"args"}`; a bare tool name means no arguments
fn parse_step(raw: &str) -> std::result::Result<ToolStep, String> {
    let (tool, args) = match raw.split_once(':') {
        Some((tool, args)) => (tool, args),
        None => (raw, "{}"),
    };
    if tool.trim().is_empty() {
        return Err("step needs a tool name".to_string());
    }
    let args: serde_json::Value =
        serde_json::from_str(args).map_err(|e| format!("invalid step arguments: {}", e))?;
    if !args.is_object() {
        return Err("step arguments must be a JSON object".to_string());
    }
    Ok(ToolStep::from_json(tool.trim(), args))
}

fn show_plan(input: &str, check: bool) -> Result<()> {
    let raw = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read planner output from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))?
    };

    let config = Config::load()?;
    let plan = PlanParser::with_max_steps(config.pipeline.max_steps)
        .parse_plan(&raw)
        .unwrap_or_else(ExecutionPlan::empty);

    println!("{}", serde_json::to_string_pretty(&plan)?);

    if check {
        let validator = StepValidator::new(
            Arc::new(ToolRegistry::with_defaults()),
            SecurityPolicy::new(&config.security),
        );
        let context = PipelineContext::new("cli");
        for step in &plan.steps {
            match validator.check(step, &context, false) {
                Ok(()) => eprintln!("✓ {}", step.tool),
                Err(reason) => eprintln!("✗ {} ({})", step.tool, reason),
            }
        }
    }

    Ok(())
}

async fn run_request(
    request: String,
    priority: Priority,
    steps: Vec<ToolStep>,
    allow_unsafe: bool,
    cwd: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load()?;

    let router = Arc::new(
        ModelRouter::new(&config.models, &config.router).context("Failed to set up model router")?,
    );
    let scheduler = StepScheduler::new(config.pipeline.clone(), router, Arc::new(DryRunExecutive::new()))
        .with_security(Arc::new(ToolRegistry::with_defaults()), &config.security)
        .with_memory_sink(Arc::new(TracingMemorySink));
    let service = PipelineService::new(Arc::new(scheduler), config.service.clone());

    let mut context = PipelineContext::new("cli");
    if let Some(dir) = cwd {
        context = context.with_working_dir(dir);
    }

    let options = SubmitOptions {
        steps: (!steps.is_empty()).then_some(steps),
        allow_unsafe,
        ..SubmitOptions::with_priority(priority).waiting()
    };

    let response = service.submit_request(request, context, options).await?;
    if let Some(result) = response.result {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    service.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

fn handle_config(show: bool, init: bool) -> Result<()> {
    let path = Config::config_path()?;

    if init {
        if path.exists() {
            println!("Configuration already exists at: {}", path.display());
        } else {
            Config::default().save()?;
            println!("✓ Wrote default configuration to: {}", path.display());
        }
        return Ok(());
    }

    if show {
        let config = Config::load()?;
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("Configuration file: {}", path.display());
    println!("Use --show to view it or --init to create it.");
    Ok(())
}
