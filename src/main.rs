use anyhow::Context;
use clap::{Parser, Subcommand};
use netorch::cli;
use netorch::config::{SuiteConfig, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "netorch")]
#[command(about = "Run tests against isolated multi-service Docker networks", long_about = None)]
#[command(version)]
struct Cli {
    /// Suite config file (defaults to ./netorch.yml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test suite
    Run {
        /// Number of tests to run concurrently
        #[arg(long)]
        parallelism: Option<usize>,
        /// Image of the service under test
        #[arg(long)]
        service_image: Option<String>,
        /// Image that runs the test controller
        #[arg(long)]
        controller_image: Option<String>,
        /// Pull the service and controller images before running
        #[arg(long)]
        pull: bool,
        /// First host port used to publish service ports
        #[arg(long)]
        port_range_start: Option<u16>,
        /// End (exclusive) of the host port range
        #[arg(long)]
        port_range_end: Option<u16>,
        /// Only run this test (repeatable)
        #[arg(long = "test")]
        tests: Vec<String>,
        /// Write a JSON report to this file
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// List the tests defined in the suite config
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SuiteConfig> {
    let config = match path {
        Some(path) => SuiteConfig::load(path),
        None => SuiteConfig::load_or_default(&std::env::current_dir()?),
    };
    config.with_context(|| {
        format!(
            "loading {}",
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string())
        )
    })
}

fn main() -> anyhow::Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            parallelism,
            service_image,
            controller_image,
            pull,
            port_range_start,
            port_range_end,
            tests,
            json,
        } => {
            let overrides = cli::run::RunOverrides {
                parallelism,
                service_image,
                controller_image,
                pull,
                port_range_start,
                port_range_end,
            };
            overrides.apply(&mut config)?;
            tracing::info!("netorch v{}", env!("CARGO_PKG_VERSION"));

            let all_passed = cli::run::run(config, &tests, json).context("running test suite")?;
            if !all_passed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::List { json } => cli::list::run(&config, json)?,
    }

    Ok(ExitCode::SUCCESS)
}
