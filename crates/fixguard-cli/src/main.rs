use std::{
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use fixguard_core::{
    build_validators, persist_report, render_report, Cancellation, EnvFile, OutputFormat,
    Orchestrator, RemediationEngine, RunContext, RunReport, EXIT_FATAL,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

use settings::Overrides;

#[derive(Parser, Debug)]
#[command(
    name = "orchestrator",
    author,
    version,
    about = "Validation and remediation orchestrator"
)]
struct Cli {
    /// TOML configuration file (defaults to ./fixguard.toml when present)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every registered validator and report the results
    Run(RunArgs),
    /// List the registered validators in execution order
    List {
        /// Emit the declarations as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Attempt automated remediation of fixable findings
    #[arg(long)]
    fix: bool,

    /// Run validators concurrently; N workers, one per CPU when N is omitted
    #[arg(
        long,
        value_name = "N",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "0"
    )]
    parallel: Option<usize>,

    /// Print the machine-readable report instead of the human summary
    #[arg(long)]
    json: bool,

    /// Hard deadline for each validator (e.g. 30s, 2m)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Directory the JSON report is written to
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,

    /// Treat a run with warnings as failed
    #[arg(long)]
    warn_as_failure: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(EXIT_FATAL)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Commands::Run(args) => run(cli.config.as_deref(), cli.verbose, args).await,
        Commands::List { json } => list(cli.config.as_deref(), json),
    };
    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(config_path: Option<&Path>, verbosity: u8, args: RunArgs) -> Result<u8> {
    let overrides = Overrides {
        fix: args.fix,
        parallel: args.parallel,
        timeout: args.timeout,
        report_dir: args.report_dir,
        warn_as_failure: args.warn_as_failure,
        verbosity,
    };
    let config = settings::load(config_path, &overrides)?;
    let validators =
        build_validators(&config.validators).context("failed to register validators")?;

    let cancellation = Cancellation::new();
    let ctx = RunContext::from_config(&config, cancellation.clone())
        .context("failed to prepare run context")?;
    let report_dir = ctx.resolve(&config.report_dir);
    std::fs::create_dir_all(&report_dir).with_context(|| {
        format!("failed to create report directory {}", report_dir.display())
    })?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            cancellation.cancel();
        }
    });

    let engine = match &config.env_file {
        Some(path) => RemediationEngine::new(Arc::new(EnvFile::new(ctx.resolve(path)))),
        None => RemediationEngine::default(),
    };
    let orchestrator = Orchestrator::new(validators, config.schedule()).with_engine(engine);
    let report = orchestrator.run(&ctx).await.context("run aborted")?;

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    // The verdict stands even when the summary cannot be shown.
    if let Err(err) = print_report(&mut std::io::stdout().lock(), &report, format) {
        eprintln!("Warning: failed to print report: {err:#}");
    }

    match persist_report(&report, &report_dir) {
        Ok(path) => info!(path = %path.display(), "report written"),
        Err(err) => eprintln!("Warning: {err}"),
    }
    Ok(report.exit_code(config.warn_as_failure))
}

fn print_report(out: &mut impl Write, report: &RunReport, format: OutputFormat) -> Result<()> {
    let mut rendered = render_report(report, format)?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    out.write_all(rendered.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn list(config_path: Option<&Path>, json: bool) -> Result<u8> {
    let config = settings::load(config_path, &Overrides::default())?;
    build_validators(&config.validators).context("failed to register validators")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config.validators)?);
        return Ok(0);
    }

    println!("{} validator(s) registered", config.validators.len());
    for spec in &config.validators {
        let resources = if spec.shared_resources.is_empty() {
            String::new()
        } else {
            format!(" (shares {})", spec.shared_resources.join(", "))
        };
        println!(
            "- {name:<20} [{kind}]{resources}",
            name = spec.name,
            kind = spec.check.label(),
        );
    }
    Ok(0)
}

fn init_tracing(verbosity: u8) {
    let default = if verbosity > 0 {
        "debug,tokio=warn"
    } else {
        "info,tokio=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
