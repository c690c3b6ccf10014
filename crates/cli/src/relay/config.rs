//! Build the effective `RelayConfig` from file, environment and flags.

use contracts::RelayConfig;
use tracing::info;

use crate::cli::OverrideArgs;
use crate::error::{CliError, Result};

/// Load the config file (if any) and apply overrides
///
/// Overrides win over the file. Without a file, `--backends` is required.
pub fn resolve_config(args: &OverrideArgs) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::config_not_found(path.display().to_string()));
            }
            info!(config = %path.display(), "Loading configuration");
            config_loader::ConfigLoader::read_from_path(path)?
        }
        None if args.backends.is_some() => RelayConfig::default(),
        None => return Err(CliError::NoConfiguration),
    };

    apply_overrides(&mut config, args)?;
    Ok(config)
}

/// Apply flag / environment overrides in place
pub fn apply_overrides(config: &mut RelayConfig, args: &OverrideArgs) -> Result<()> {
    if let Some(raw) = &args.backends {
        config.backends = RelayConfig::parse_backend_list(raw);
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(index) = args.primary_index {
        config.primary_index = index;
    }
    if args.kill_switch {
        config.kill_switch = true;
    }
    if let Some(raw) = &args.targets_enabled {
        config.targets_enabled = RelayConfig::parse_enabled_list(raw);
    }
    if let Some(rate) = args.sample_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(CliError::invalid_override(
                "sample_rate",
                format!("{rate} is outside [0, 1]"),
            ));
        }
        config.sample_rate = rate;
    }
    if let Some(ms) = args.target_timeout_ms {
        if ms == 0 {
            return Err(CliError::invalid_override("target_timeout_ms", "must be > 0"));
        }
        config.target.connect_timeout_ms = ms;
    }
    if let Some(ms) = args.send_timeout_ms {
        if ms == 0 {
            return Err(CliError::invalid_override("send_timeout_ms", "must be > 0"));
        }
        config.target.send_timeout_ms = ms;
    }
    Ok(())
}
