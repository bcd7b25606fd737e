use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use toio_teleop_runtime::config::Config;
use toio_teleop_runtime::runtime::{self, RunOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Teleoperate a toio Core Cube from a browser joystick and record demonstrations
#[derive(Parser, Debug)]
#[command(name = "toio-teleop-runtime", version)]
struct Args {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller socket address, e.g. 0.0.0.0:8765
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Connect to this cube address instead of scanning by name
    #[arg(long)]
    address: Option<String>,

    /// Drive without recording
    #[arg(long)]
    no_record: bool,

    /// Also drive from this terminal (WASD)
    #[arg(long)]
    keyboard: bool,
}

fn load_config(args: &Args) -> toio_teleop_runtime::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            Config::load(path)?
        }
        None => Config::default(),
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(address) = &args.address {
        config.robot.address = Some(address.clone());
    }
    if args.no_record {
        config.recording.enabled = false;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (RUST_LOG overrides, info by default)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match load_config(&args) {
        Ok(config) => {
            runtime::run(
                config,
                RunOptions {
                    keyboard: args.keyboard,
                },
            )
            .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
