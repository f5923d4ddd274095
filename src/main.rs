//! RuleFlow CLI Entry Point
//!
//! Builds targets of the bundled proteomics pipeline.
//!
//! # Usage
//!
//! ```bash
//! # Build every default target
//! ruleflow --config pipeline.yaml -j 8
//!
//! # Build specific targets
//! ruleflow results/human/run_01.summary.tsv
//!
//! # Preview which jobs would run
//! ruleflow --dry-run
//!
//! # Render the job graph
//! ruleflow --dag | dot -Tsvg > dag.svg
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use ruleflow::environment::IsolationSettings;
use ruleflow::execution::{Engine, JobRunner};
use ruleflow::monitoring::{self, RunSummary};
use ruleflow::workflow::{DagBuilder, FileSnapshot, PipelineConfig};
use ruleflow::{pipeline, APP_NAME, VERSION};

/// Default configuration file used when none is specified.
const DEFAULT_CONFIG: &str = "pipeline.yaml";

#[derive(Parser, Debug)]
#[command(name = "ruleflow", version, about = "Wildcard-driven pipeline build engine")]
struct Cli {
    /// Target paths to build (default: every pipeline summary)
    targets: Vec<String>,

    /// Pipeline configuration (YAML)
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Total weight of concurrently running jobs (default: number of CPUs)
    #[arg(short = 'j', long)]
    cores: Option<usize>,

    /// Run rules with a conda environment inside it
    #[arg(long)]
    use_conda: bool,

    /// Run rules with a container image inside it
    #[arg(long)]
    use_containers: bool,

    /// Show which jobs would run without running them
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Run every job regardless of staleness
    #[arg(short = 'F', long)]
    forceall: bool,

    /// Print the job graph in Graphviz format and exit
    #[arg(long)]
    dag: bool,

    /// List the pipeline rules and exit
    #[arg(long)]
    list_rules: bool,

    /// Working directory all paths are relative to
    #[arg(short = 'd', long)]
    directory: Option<PathBuf>,

    /// Write a JSON run summary to this file
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Print an execution timeline after the run
    #[arg(long)]
    timeline: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
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
    println!("Wildcard-Driven Pipeline Build Engine");
    println!();
}

/// Validates and switches to the working directory.
fn setup_working_directory(dir: Option<&Path>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(dir) = dir {
        if !dir.is_dir() {
            return Err(format!("Working directory does not exist: {}", dir.display()).into());
        }
        env::set_current_dir(dir)?;
    }
    let current = env::current_dir()?;
    info!("Working directory: {}", current.display());
    Ok(current)
}

/// Loads the configuration; the default file may be absent.
fn load_config(path: &Path) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        warn!(
            "No {} found, using an empty configuration",
            DEFAULT_CONFIG
        );
        return Ok(PipelineConfig::default());
    }
    Ok(PipelineConfig::load(path)?)
}

/// Main application logic; returns whether the run succeeded.
async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let working_dir = setup_working_directory(cli.directory.as_deref())?;

    let config = Arc::new(load_config(&cli.config)?);
    let registry = pipeline::registry(Arc::clone(&config))?;

    if cli.list_rules {
        for rule in registry.rules() {
            let outputs: Vec<String> = rule.output_templates().map(|t| t.to_string()).collect();
            println!("{:16} -> {}", rule.name(), outputs.join(", "));
        }
        return Ok(true);
    }

    let targets = if cli.targets.is_empty() {
        pipeline::default_targets(&registry)?
    } else {
        cli.targets.clone()
    };

    let dag = DagBuilder::new(&registry, FileSnapshot::live_in(&working_dir)).build(&targets)?;

    if cli.dag {
        print!("{}", dag.to_dot());
        return Ok(true);
    }

    let settings = IsolationSettings::from_config(&config, cli.use_conda, cli.use_containers);
    let runner = JobRunner::new(working_dir, settings);

    let mut engine = Engine::new(dag, Arc::new(runner));
    engine.set_max_weight(cli.cores.unwrap_or_else(num_cpus::get));
    engine.set_force_all(cli.forceall);
    engine.set_dry_run(cli.dry_run);

    // Ctrl-C stops dispatch and kills running jobs.
    let abort = engine.abort_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping running jobs");
                abort.abort();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let report = tokio::task::spawn_blocking(move || engine.run()).await??;

    println!();
    println!("{}", monitoring::render(&report));
    if cli.timeline && !report.dry_run {
        println!("{}", report.timeline.gantt_chart());
    }

    if let Some(path) = &cli.summary_json {
        RunSummary::new(&report).write(path)?;
        info!("Run summary written to {}", path.display());
    }

    Ok(report.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    if !cli.dag {
        print_banner();
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
