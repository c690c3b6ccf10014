//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{DeliveryMode, RelayConfig};
use delivery::redact_address;
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    mode: String,
    backend_count: usize,
    enabled_count: usize,
    kill_switch: bool,
    sample_rate: f64,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            let enabled_count = (0..config.backends.len())
                .filter(|&i| config.is_enabled(i))
                .count();

            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: (!warnings.is_empty()).then_some(warnings),
                summary: Some(ConfigSummary {
                    version: format!("{:?}", config.version),
                    mode: config.mode.to_string(),
                    backend_count: config.backends.len(),
                    enabled_count,
                    kill_switch: config.kill_switch,
                    sample_rate: config.sample_rate,
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &RelayConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.kill_switch {
        warnings.push("kill_switch is on - no frames will be delivered".to_string());
    }

    for (i, address) in config.backends.iter().enumerate() {
        if !config.is_enabled(i) {
            warnings.push(format!(
                "Backend [{}] {} is disabled",
                i,
                redact_address(address)
            ));
        }
    }

    if config.mode == DeliveryMode::Single && !config.is_enabled(config.primary_index) {
        warnings.push(format!(
            "Primary backend [{}] is disabled - single mode will reject every frame",
            config.primary_index
        ));
    }

    if config.sample_rate == 0.0 {
        warnings.push("sample_rate is 0 - ack latency will not be measured".to_string());
    }

    if config.targets_enabled.len() < config.backends.len() && !config.targets_enabled.is_empty()
    {
        warnings.push(format!(
            "targets_enabled has {} entries for {} backends - the rest default to enabled",
            config.targets_enabled.len(),
            config.backends.len()
        ));
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Mode: {}", summary.mode);
            println!(
                "  Backends: {} ({} enabled)",
                summary.backend_count, summary.enabled_count
            );
            println!("  Kill switch: {}", summary.kill_switch);
            println!("  Sample rate: {}", summary.sample_rate);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
