use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use glacier_workflow::config::ConfigError;
use glacier_workflow::tasks::reference_registry;
use glacier_workflow::{load_entities, PipelineDriver, PipelinePlan, WorkflowConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glacier-workflow")]
#[command(about = "Multi-stage glacier directory workflow runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize glacier directories and run every enabled stage
    Run(RunArgs),
    /// Print the validated execution plan
    Plan {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List the registered tasks
    Tasks,
}

#[derive(Args)]
struct RunArgs {
    /// Workflow file (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Entity file, overriding `entities.file`
    #[arg(long)]
    entities: Option<PathBuf>,

    /// Process one glacier at a time
    #[arg(long, default_value_t = false)]
    sequential: bool,

    /// Record failures and keep going
    #[arg(long, default_value_t = false)]
    continue_on_error: bool,

    /// Only run these glacier ids (repeatable)
    #[arg(long = "select", value_name = "ID")]
    select: Vec<String>,

    /// Discard existing glacier directories
    #[arg(long, default_value_t = false)]
    reset: bool,

    /// Allow reset over existing state
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Worker pool size (0 = all hardware threads)
    #[arg(long)]
    workers: Option<usize>,

    /// Run report path, overriding `<working_dir>/workflow_report.json`
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Plan { config } => {
            let config = WorkflowConfig::from_yaml_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let registry = reference_registry()?;
            let plan = PipelinePlan::new(config.stages.clone(), &registry)?;
            plan.check_prerequisites(&config.run_flags, config.execution.strict_stages)?;
            println!("{}", plan.execution_plan(&config.run_flags));
            Ok(())
        }
        Commands::Tasks => {
            let registry = reference_registry()?;
            for task in registry.iter() {
                println!("{:<22} {:<10} {}", task.name(), task.kind().to_string(), task.description());
            }
            Ok(())
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = WorkflowConfig::from_yaml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.sequential {
        config.execution.use_multiprocessing = false;
    }
    if args.continue_on_error {
        config.execution.continue_on_error = true;
    }
    if !args.select.is_empty() {
        config.entities.selection = Some(args.select);
    }
    config.init.reset |= args.reset;
    config.init.force |= args.force;
    if let Some(workers) = args.workers {
        config.execution.num_workers = workers;
    }
    config.validate()?;
    config.ensure_directories()?;

    let entity_file = args
        .entities
        .or_else(|| config.entities.file.clone())
        .ok_or_else(|| ConfigError::MissingSetting("entities.file".to_string()))?;
    let entities = load_entities(&entity_file)?;

    let registry = reference_registry()?;
    let mut driver = PipelineDriver::from_config(&config, &registry)?;
    if let Some(report) = args.report {
        driver.options_mut().report_path = Some(report);
    }

    let report = driver.run(entities, &config.task_config())?;
    if report.total_failed() > 0 {
        warn!(
            "Run {} finished with {} failed invocations ({} glaciers tainted)",
            report.run_id,
            report.total_failed(),
            report.tainted.len()
        );
    } else {
        info!("Run {} finished without failures", report.run_id);
    }
    Ok(())
}
