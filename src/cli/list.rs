use crate::config::SuiteConfig;
use crate::errors::Result;
use colored::*;

/// Print the tests defined in the suite config
pub fn run(config: &SuiteConfig, json: bool) -> Result<()> {
    if json {
        let names: Vec<&str> = config.tests.iter().map(|t| t.name.as_str()).collect();
        let json_output = serde_json::to_string_pretty(&names)?;
        println!("{}", json_output);
        return Ok(());
    }

    if config.tests.is_empty() {
        println!("{}", "No tests defined".yellow());
        return Ok(());
    }

    println!("{:<30} {:<10} {}", "TEST", "SERVICES", "IMAGES");
    println!("{}", "-".repeat(60));

    for test in &config.tests {
        let images: Vec<&str> = test
            .services
            .iter()
            .map(|s| s.image.as_deref().unwrap_or(config.service_image.as_str()))
            .collect();
        println!(
            "{:<30} {:<10} {}",
            test.name.cyan(),
            test.services.len(),
            images.join(", ").dimmed()
        );
    }

    Ok(())
}
