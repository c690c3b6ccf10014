//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{DeliveryMode, RelayConfig, TargetTuning};
use delivery::redact_address;
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;
use crate::relay::resolve_config;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    mode: DeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    primary_index: Option<usize>,
    kill_switch: bool,
    sample_rate: f64,
    backends: Vec<BackendInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tuning: Option<TargetTuning>,
    report_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics_port: Option<u16>,
}

#[derive(Serialize)]
struct BackendInfo {
    index: usize,
    address: String,
    enabled: bool,
    primary: bool,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!("Loading configuration info");

    let config = resolve_config(&args.overrides).context("Failed to resolve configuration")?;
    let config_info = build_config_info(&config, args.tuning);

    if args.json {
        let json = serde_json::to_string_pretty(&config_info)
            .context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&config_info);
    }

    Ok(())
}

fn build_config_info(config: &RelayConfig, with_tuning: bool) -> ConfigInfo {
    let single = config.mode == DeliveryMode::Single;
    let backends = config
        .backends
        .iter()
        .enumerate()
        .map(|(index, address)| BackendInfo {
            index,
            address: redact_address(address),
            enabled: config.is_enabled(index),
            primary: single && index == config.primary_index,
        })
        .collect();

    ConfigInfo {
        version: format!("{:?}", config.version),
        mode: config.mode,
        primary_index: single.then_some(config.primary_index),
        kill_switch: config.kill_switch,
        sample_rate: config.sample_rate,
        backends,
        tuning: with_tuning.then(|| config.target.clone()),
        report_interval_secs: config.status.report_interval_secs,
        metrics_port: config.status.metrics_port,
    }
}

fn print_config_info(info: &ConfigInfo) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               Telemetry Relay Configuration                  ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("⚙️  Routing");
    println!("   ├─ Version: {}", info.version);
    println!("   ├─ Mode: {}", info.mode);
    if let Some(primary) = info.primary_index {
        println!("   ├─ Primary: [{}]", primary);
    }
    println!(
        "   ├─ Kill switch: {}",
        if info.kill_switch { "ACTIVE" } else { "off" }
    );
    println!("   └─ Ack sample rate: {}", info.sample_rate);

    println!("\n📤 Backends ({})", info.backends.len());
    for (i, backend) in info.backends.iter().enumerate() {
        let prefix = if i == info.backends.len() - 1 {
            "└─"
        } else {
            "├─"
        };
        let mut flags = Vec::new();
        if !backend.enabled {
            flags.push("disabled");
        }
        if backend.primary {
            flags.push("primary");
        }
        if flags.is_empty() {
            println!("   {} [{}] {}", prefix, backend.index, backend.address);
        } else {
            println!(
                "   {} [{}] {} ({})",
                prefix,
                backend.index,
                backend.address,
                flags.join(", ")
            );
        }
    }

    if let Some(ref tuning) = info.tuning {
        println!("\n🔧 Per-target tuning");
        println!("   ├─ Connect timeout: {} ms", tuning.connect_timeout_ms);
        println!("   ├─ Send timeout: {} ms", tuning.send_timeout_ms);
        println!("   ├─ Queue capacity: {}", tuning.queue_capacity);
        println!("   ├─ Stale after: {} ms", tuning.stale_after_ms);
        println!("   └─ Ack timeout: {} ms", tuning.ack_timeout_ms);
    }

    println!("\n📈 Status");
    println!("   ├─ Report interval: {} s", info.report_interval_secs);
    match info.metrics_port {
        Some(port) => println!("   └─ Metrics port: {}", port),
        None => println!("   └─ Metrics port: (disabled)"),
    }

    println!();
}
