//! `run` command implementation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use contracts::RelayConfig;
use delivery::{redact_address, DeliveryManager};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::RunArgs;
use crate::relay::{resolve_config, run_relay, RelayOptions, SourceKind};

/// Execute the `run` command
pub async fn run_relay_command(args: &RunArgs) -> Result<()> {
    let mut config =
        resolve_config(&args.overrides).context("Failed to resolve relay configuration")?;
    if let Some(secs) = args.report_interval {
        config.status.report_interval_secs = secs;
    }
    if let Some(port) = args.metrics_port {
        config.status.metrics_port = (port != 0).then_some(port);
    }

    // Misconfiguration is reported but not fatal; the manager runs degraded
    if let Err(e) = config_loader::validate(&config) {
        warn!(error = %e, "Configuration has problems, delivery may be degraded");
    }

    info!(
        backends = config.backends.len(),
        mode = %config.mode,
        primary = config.primary_index,
        kill_switch = config.kill_switch,
        sample_rate = config.sample_rate,
        "Configuration loaded"
    );

    if args.dry_run {
        info!("Dry run mode - configuration resolved, exiting");
        print_config_summary(&config);
        return Ok(());
    }

    if let Some(port) = config.status.metrics_port {
        observability::init_metrics_only(port)?;
        info!("Metrics endpoint available on port {}", port);
    }

    let manager = Arc::new(DeliveryManager::from_config(&config));
    if let Some(e) = manager.config_error() {
        error!(error = %e, "Frames will not be routed until the configuration is fixed");
    }

    let source = if args.mock {
        SourceKind::Mock {
            session_id: args
                .session_id
                .clone()
                .unwrap_or_else(|| format!("mock-{}", unix_secs())),
            rate_hz: args.rate_hz,
        }
    } else {
        SourceKind::Stdin
    };
    let options = RelayOptions {
        source,
        max_frames: (args.max_frames != 0).then_some(args.max_frames),
        report_interval: Some(Duration::from_secs(config.status.report_interval_secs)),
        drain: Duration::from_secs(args.drain_secs),
    };

    // Setup graceful shutdown handler
    let cancel = CancellationToken::new();
    let signal_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };
    let timeout_task = (args.timeout != 0).then(|| {
        let cancel = cancel.clone();
        let limit = Duration::from_secs(args.timeout);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            warn!(timeout_secs = limit.as_secs(), "Relay timed out");
            cancel.cancel();
        })
    });

    info!("Starting relay...");
    let result = run_relay(Arc::clone(&manager), options, cancel).await;
    signal_task.abort();
    if let Some(task) = timeout_task {
        task.abort();
    }

    let stats = result.context("Relay execution failed")?;
    info!(
        frames_read = stats.frames_read,
        frames_accepted = stats.frames_accepted,
        duration_secs = stats.duration.as_secs_f64(),
        "Relay finished"
    );
    stats.print_summary(&manager.parity_snapshot());

    Ok(())
}

/// Seconds since the epoch, for default mock session ids
fn unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print configuration summary for dry-run mode
fn print_config_summary(config: &RelayConfig) {
    println!("\n=== Relay Configuration ===\n");
    println!("Mode: {}", config.mode);
    if config.mode == contracts::DeliveryMode::Single {
        println!("Primary index: {}", config.primary_index);
    }
    println!("Kill switch: {}", if config.kill_switch { "ACTIVE" } else { "off" });
    println!("Ack sample rate: {}", config.sample_rate);

    println!("\nBackends ({}):", config.backends.len());
    for (i, address) in config.backends.iter().enumerate() {
        let state = if config.is_enabled(i) { "enabled" } else { "disabled" };
        println!("  [{}] {} ({})", i, redact_address(address), state);
    }

    println!(
        "\nTimeouts: connect {}ms, send {}ms, stale {}ms, ack {}ms",
        config.target.connect_timeout_ms,
        config.target.send_timeout_ms,
        config.target.stale_after_ms,
        config.target.ack_timeout_ms
    );
    println!("Queue capacity: {}", config.target.queue_capacity);
    println!();
}
