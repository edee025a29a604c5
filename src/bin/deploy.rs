//! deltadeploy command line
//!
//! Deploys a package to a device through the device-bridge server and
//! prints the outcome as JSON

use anyhow::{Context, Result};
use clap::Parser;
use deltadeploy::{AdbChannel, DeployConfig, DeployRequest, OrchestratorBuilder};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "deltadeploy")]
#[command(about = "Incrementally deploy an application package to a device")]
struct Args {
    /// Application package id
    package_id: String,

    /// Base archive
    base_archive: PathBuf,

    /// Additional archives installed together with the base
    additional: Vec<PathBuf>,

    /// Archives currently installed, to diff against. Each run starts with
    /// no remembered deployment, so without this every run reinstalls.
    #[arg(long, num_args = 1..)]
    previous: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Target device serial (the only attached device when omitted)
    #[arg(short = 's', long)]
    serial: Option<String>,

    /// Device-bridge server port
    #[arg(long, default_value_t = deltadeploy::core::device::adb::DEFAULT_PORT)]
    adb_port: u16,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DeployConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeployConfig::default(),
    };
    // No debugger connector ships with the command line
    config.live_swap = false;

    let device = Arc::new(AdbChannel::local(args.adb_port, args.serial.clone()));
    let orchestrator = OrchestratorBuilder::new(device)
        .config(config)
        .build()
        .context("building orchestrator")?;

    let mut archives = vec![args.base_archive.clone()];
    archives.extend(args.additional.iter().cloned());
    let mut request = DeployRequest::new(&args.package_id, archives);
    if !args.previous.is_empty() {
        request = request.with_previous(args.previous.clone());
    }

    info!("Deploying {}", args.package_id);
    let outcome = orchestrator.deploy(&request);
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(if outcome.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
