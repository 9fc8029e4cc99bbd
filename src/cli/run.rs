use crate::config::{PortRange, SuiteConfig};
use crate::docker::cli::DockerCli;
use crate::errors::{NetError, Result};
use crate::executor::{StateListener, TestOutcome, TestState};
use crate::runner::{SuiteReport, TestSuiteRunner};
use colored::*;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line values that take precedence over the config file
#[derive(Debug, Default, Clone)]
pub struct RunOverrides {
    pub parallelism: Option<usize>,
    pub service_image: Option<String>,
    pub controller_image: Option<String>,
    pub pull: bool,
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut SuiteConfig) -> Result<()> {
        if let Some(parallelism) = self.parallelism {
            if parallelism == 0 {
                return Err(NetError::ConfigError(
                    "parallelism must be at least 1".to_string(),
                ));
            }
            config.parallelism = parallelism;
        }
        if let Some(image) = &self.service_image {
            config.service_image = image.clone();
        }
        if let Some(image) = &self.controller_image {
            config.controller_image = image.clone();
        }
        if self.pull {
            config.pull_images = true;
        }

        match (self.port_range_start, self.port_range_end) {
            (None, None) => {}
            (Some(start), Some(end)) => {
                if start >= end {
                    return Err(NetError::ConfigError(format!(
                        "--port-range-start {} must be below --port-range-end {}",
                        start, end
                    )));
                }
                config.host_port_range = Some(PortRange { start, end });
            }
            _ => {
                return Err(NetError::ConfigError(
                    "--port-range-start and --port-range-end must be given together".to_string(),
                ))
            }
        }
        Ok(())
    }
}

/// Prints one line per test state change
struct ProgressPrinter;

impl StateListener for ProgressPrinter {
    fn on_state_change(&self, test_name: &str, state: TestState) {
        let label = match state {
            TestState::Queued => "queued".dimmed(),
            TestState::NetworkCreating => "creating network".normal(),
            TestState::ControllerRunning => "running".cyan(),
            TestState::Finished => "finished".bold(),
        };
        eprintln!("  {:<30} {}", test_name, label);
    }
}

/// Run the suite; returns whether every selected test passed
pub fn run(config: SuiteConfig, tests: &[String], json: Option<PathBuf>) -> Result<bool> {
    let docker = DockerCli::new();
    if !docker.is_available() {
        return Err(NetError::Runtime {
            operation: "version".to_string(),
            message: "docker binary not found on PATH".to_string(),
        });
    }

    let runner = TestSuiteRunner::new(Arc::new(docker), config)
        .with_listener(Arc::new(ProgressPrinter));
    let report = runner.run(tests)?;
    print_summary(&report);

    if let Some(path) = json {
        let json_output = serde_json::to_string_pretty(&report.to_json_report())?;
        fs::write(&path, json_output)?;
        println!("Report written to {}", path.display().to_string().cyan());
    }

    Ok(report.all_passed())
}

fn print_summary(report: &SuiteReport) {
    println!();
    println!("{}", "Test Results".bold());
    println!("{}", "═".repeat(60));

    for result in report.results.values() {
        let status = match &result.outcome {
            TestOutcome::Passed => "PASSED".green().bold(),
            TestOutcome::Failed { .. } => "FAILED".red().bold(),
            TestOutcome::ExecutionError(_) => "ERROR".yellow().bold(),
        };
        println!("{:<30} {}", result.test_name.cyan(), status);
        if let Some(e) = result.execution_error() {
            println!("  {}", e.to_string().dimmed());
        }
        println!("  {} {}", "Log:".bold(), result.log_path.display().to_string().dimmed());
    }

    println!("{}", "═".repeat(60));
    let elapsed = report.finished_at - report.started_at;
    println!(
        "{} passed, {} failed, {} errored in {}s (execution {})",
        report.passed_count().to_string().green().bold(),
        report.failed_count().to_string().red().bold(),
        report.error_count().to_string().yellow().bold(),
        elapsed.num_seconds(),
        report.execution_id.to_string().dimmed()
    );
}
