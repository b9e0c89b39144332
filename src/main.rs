//! Crowdpipe - YAML-driven crowdsourcing pipelines
//!
//! A CLI tool that provisions projects, pools and trainings on a
//! crowdsourcing platform from declarative YAML configuration, then routes
//! completed assignments between pools until the pipeline drains.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (connection, platform API, pipeline failure)
//!   2 - Configuration or validation error

mod actions;
mod cli;
mod config;
mod data;
mod pipeline;
mod platform;
mod task;

use anyhow::{Context, Result};
use cli::Args;
use config::{Credentials, LoadedPipeline};
use pipeline::{RunOptions, SequencePlan, TaskSequence};
use platform::PlatformClient;
use std::time::Duration;
use task::core::suggested_reward;
use tracing::{debug, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    // Handle --suggest-reward early (no logging needed)
    if let Some(seconds) = args.suggest_reward {
        println!(
            "A task suite estimated at {}s pays a fair hourly wage of ${} at a reward of ${:.3}",
            seconds,
            task::core::FAIR_HOURLY_WAGE,
            suggested_reward(seconds)
        );
        return Ok(());
    }

    // Handle --init-config early
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("Crowdpipe v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    // Build the sequence plan; every failure up to here is a configuration
    // problem.
    let plan = match prepare_plan(&args) {
        Ok(plan) => plan,
        Err(e) => {
            error!("Invalid pipeline configuration: {:#}", e);
            eprintln!("\n❌ Configuration error: {:#}", e);
            std::process::exit(2);
        }
    };

    // Handle --dry-run: show the pool table and exit
    if args.dry_run {
        println!("\n🔍 Dry run: validated pipeline (no API calls)");
        plan.print_pool_table();
        println!("✅ Dry run complete. {} tasks, {} actions.", plan.tasks.len(), plan.actions.len());
        return Ok(());
    }

    // Run the pipeline
    match run_pipeline(args, plan).await {
        Ok(()) => {
            println!("\n✅ Task sequence complete.");
            Ok(())
        }
        Err(e) => {
            error!("Pipeline failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate starter configuration files.
fn handle_init_config() -> Result<()> {
    let pipeline_path = std::path::Path::new("pipeline.yaml");
    if pipeline_path.exists() {
        eprintln!("⚠️  pipeline.yaml already exists. Remove it first or edit it manually.");
        std::process::exit(2);
    }

    std::fs::create_dir_all("tasks").context("Failed to create the tasks directory")?;
    std::fs::write(pipeline_path, STARTER_PIPELINE).context("Failed to write pipeline.yaml")?;
    std::fs::write("tasks/classify.yaml", STARTER_TASK)
        .context("Failed to write tasks/classify.yaml")?;

    println!("✅ Created pipeline.yaml and tasks/classify.yaml with starter settings.");
    println!("   Edit them to configure your project, pool, rewards and data.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Load and validate everything that does not need the platform.
fn prepare_plan(args: &Args) -> Result<SequencePlan> {
    let pipeline_path = args
        .pipeline
        .as_ref()
        .expect("clap requires --pipeline for this path");

    info!("Loading pipeline from {}", pipeline_path.display());
    let pipeline = LoadedPipeline::load(pipeline_path)?;
    SequencePlan::new(pipeline)
}

/// Run the complete pipeline workflow.
async fn run_pipeline(args: Args, plan: SequencePlan) -> Result<()> {
    // Load credentials; a --token flag or CROWDPIPE_TOKEN overrides the file
    let mut creds = load_credentials(&args)?;
    if let Some(token) = &args.token {
        creds.token = token.clone();
    }

    let base_url = creds.base_url()?;
    println!("🌐 Connecting to the platform...");
    println!("   Endpoint: {}", base_url);
    println!("   Mode: {:?}", creds.mode);

    let client = PlatformClient::new(base_url, &creds.token)?;

    // Confirm the credentials and show the account state up front
    let requester = client
        .get_requester()
        .await
        .context("Could not fetch the requester account; check the credentials")?;
    info!("Using the platform with requester ID {}", requester.id);
    info!("Current balance on this account is ${}", requester.balance);

    let options = RunOptions {
        poll_interval: Duration::from_secs(args.poll_interval),
        allow_low_reward: args.allow_low_reward,
        no_exit: args.no_exit,
        ..RunOptions::default()
    };

    println!("\n🚀 Starting pipeline with {} tasks and {} actions...\n", plan.tasks.len(), plan.actions.len());

    let mut sequence = TaskSequence::new(plan, client, options);
    sequence.run().await
}

/// Load the credentials file, tolerating a missing file when a token was
/// passed directly.
fn load_credentials(args: &Args) -> Result<Credentials> {
    if args.credentials.exists() {
        return Credentials::load(&args.credentials);
    }

    match &args.token {
        Some(token) => Ok(Credentials {
            token: token.clone(),
            mode: config::PlatformMode::Production,
            api_url: None,
            sandbox_url: None,
        }),
        None => anyhow::bail!(
            "Credentials file does not exist: {}",
            args.credentials.display()
        ),
    }
}

const STARTER_PIPELINE: &str = r#"# Crowdpipe pipeline: tasks run in order, actions wire them together.
name: starter
tasks:
  - kind: image_classification
    config: tasks/classify.yaml
actions: []
"#;

const STARTER_TASK: &str = r#"# A minimal image classification task.
name: classify
data:
  file: data/classify.tsv
  input:
    url: url
  output:
    result: bool
interface:
  prompt: "Does the image contain text?"
  labels:
    "true": "Yes"
    "false": "No"
project:
  setup:
    public_name: "Classify images"
    public_description: "Look at the image and answer the question."
  instructions: instructions/classify.html
pool:
  estimated_time_per_suite: 30
  setup:
    private_name: "Classify images"
    reward_per_assignment: 0.15
    assignment_max_duration_seconds: 600
    auto_accept_solutions: true
  defaults:
    default_overlap_for_new_task_suites: 3
    default_overlap_for_new_tasks: 3
  mixer:
    real_tasks_count: 4
    golden_tasks_count: 1
    training_tasks_count: 0
"#;
