//! # vlink
//!
//! Command-line tool for the vlink vehicle link.
//!
//! This binary provides:
//! - Configuration file management (show, create, validate, set VIN and key)
//! - A resilience drill that runs the full client stack against a simulated
//!   vehicle with scripted failures
//!
//! ## Running
//!
//! ```bash
//! vlink config create
//! vlink config set-vin 5YJ3E1EA4KF000001
//! vlink drill --scan-failures 2 --query-failures 3
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use vlink_core::{Client, LinkConfig, OpContext, SimulatedVehicle};

mod logging;

/// VIN used by the drill when the configuration has none.
const DRILL_VIN: &str = "5YJ3E1EA4KF000001";

#[derive(Parser)]
#[command(name = "vlink", version)]
#[command(about = "Resilient vehicle link: configuration and drills", long_about = None)]
struct Cli {
    /// Path to the configuration file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Exercise retries, the circuit breaker and scan retries against a
    /// simulated vehicle
    Drill(DrillArgs),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Display the current configuration
    Show,
    /// Create a configuration file with defaults
    Create {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration file
    Validate,
    /// Set the vehicle VIN
    SetVin {
        /// 17-character vehicle identification number
        vin: String,
    },
    /// Set the private key file
    SetKey {
        /// Path to the private key
        path: PathBuf,
    },
}

#[derive(Args)]
struct DrillArgs {
    /// Scans that fail before the vehicle is found
    #[arg(long, default_value_t = 0)]
    scan_failures: u32,

    /// State queries that fail before queries succeed
    #[arg(long, default_value_t = 0)]
    query_failures: u32,

    /// Keep the vehicle out of range for the whole drill
    #[arg(long)]
    offline: bool,

    /// Number of state queries to issue
    #[arg(long, default_value_t = 3)]
    queries: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => LinkConfig::default_path()?,
    };

    let logging_config = LinkConfig::load_or_default(&path)
        .map(|config| config.logging)
        .unwrap_or_default();
    logging::init(&logging_config)?;

    match cli.command {
        Commands::Config(command) => run_config(command, &path),
        Commands::Drill(args) => run_drill(args, &path).await,
    }
}

// =============================================================================
// CONFIG
// =============================================================================

fn run_config(command: ConfigCommand, path: &Path) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = LinkConfig::load(path)?;
            println!("# Configuration loaded from: {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::Create { force } => {
            if path.exists() && !force {
                bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            LinkConfig::default().save(path)?;
            println!("Created default configuration at {}", path.display());
            println!("Set your VIN with: vlink config set-vin <VIN>");
        }
        ConfigCommand::Validate => {
            let config = LinkConfig::load(path)?;
            config
                .validate()
                .with_context(|| format!("{} is invalid", path.display()))?;
            println!("Configuration at {} is valid", path.display());
        }
        ConfigCommand::SetVin { vin } => {
            let vin = vin.trim().to_ascii_uppercase();
            let mut config = LinkConfig::load_or_default(path)?;
            config.vehicle.vin = vin;
            validate_field(&config, "vehicle.vin")?;
            config.save(path)?;
            println!("VIN set to {}", config.vehicle.vin);
        }
        ConfigCommand::SetKey { path: key } => {
            if !key.is_file() {
                bail!("private key file not found: {}", key.display());
            }
            let mut config = LinkConfig::load_or_default(path)?;
            config.vehicle.private_key_file = Some(key);
            config.save(path)?;
            println!("Private key file set");
        }
    }
    Ok(())
}

/// Fails if `field` is among the validation problems, ignoring other fields
/// that may not be configured yet.
fn validate_field(config: &LinkConfig, field: &str) -> anyhow::Result<()> {
    use vlink_core::ConfigError;

    match config.validate() {
        Err(ConfigError::Validation { field: f, message }) if f == field => {
            bail!("invalid {f}: {message}")
        }
        Err(ConfigError::MultipleValidation(problems)) => {
            if let Some(problem) = problems.iter().find(|p| p.field == field) {
                bail!("invalid {problem}");
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// =============================================================================
// DRILL
// =============================================================================

async fn run_drill(args: DrillArgs, path: &Path) -> anyhow::Result<()> {
    let mut config = LinkConfig::load_or_default(path)?;
    if config.vehicle.vin.is_empty() {
        config.vehicle.vin = DRILL_VIN.into();
    }

    let vehicle = Arc::new(SimulatedVehicle::new(config.vehicle.vin.clone()));
    vehicle.fail_next_scans(args.scan_failures);
    vehicle.fail_next_queries(args.query_failures);
    vehicle.set_offline(args.offline);

    let client = Client::new(vehicle.clone(), &config);
    let ctx = OpContext::background();
    info!(vin = %client.vin(), "starting drill");

    let connect = client.connect(&ctx).await;
    let mut queries = Vec::new();
    if connect.is_ok() {
        for _ in 0..args.queries {
            let outcome = match client.get_state(&ctx).await {
                Ok(state) => json!({ "ok": true, "fetched_at": state.fetched_at }),
                Err(err) => json!({
                    "ok": false,
                    "code": err.error_code(),
                    "error": err.to_string(),
                }),
            };
            queries.push(outcome);
        }
    }

    let report = json!({
        "connect": match &connect {
            Ok(()) => json!({ "ok": true }),
            Err(err) => json!({ "ok": false, "code": err.error_code(), "error": err.to_string() }),
        },
        "queries": queries,
        "connection": client.connection_info(),
        "circuit_state": client.circuit_state(),
        "transport_calls": {
            "scan": vehicle.scan_calls(),
            "open": vehicle.open_calls(),
            "query": vehicle.query_calls(),
            "close": vehicle.close_calls(),
        },
    });

    client.disconnect().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
