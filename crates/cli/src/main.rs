//! # Telemetry Relay CLI
//!
//! 命令行接口入口点。
//!
//! 提供：
//! - 配置加载、覆盖与验证
//! - 遥测帧转发与生命周期管理
//! - 优雅关闭处理

mod cli;
mod commands;
mod error;
mod relay;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{Cli, Commands};
use observability::ObservabilityConfig;
use commands::{run_info, run_relay_command, run_validate};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging based on CLI options
    init_logging(&cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry Relay CLI starting"
    );

    // Execute command
    let result = match &cli.command {
        Commands::Run(args) => run_relay_command(args).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Info(args) => run_info(args),
    };

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }

    result
}

/// Initialize logging based on CLI options
fn init_logging(cli: &Cli) -> Result<()> {
    let config =
        ObservabilityConfig::from_verbosity(cli.verbose, cli.quiet, cli.log_format.into());
    observability::init_logging(&config)
}
