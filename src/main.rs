//! m3combi - Korg M3 combination copy tool
//!
//! Exchanges SysEx with an M3 workstation and copies combination patches
//! between banks from an interactive prompt.

use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use m3combi::cli;
use m3combi::config::AppConfig;
use m3combi::device::{discovery, InputDevice, OutputDevice};
use m3combi::workflow::PatchCopier;

/// Copy Korg M3 combination patches between banks over MIDI SysEx
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,

    /// Input (KEYBOARD) port name pattern, overriding the config
    #[arg(long)]
    input_port: Option<String>,

    /// Output (SOUND) port name pattern, overriding the config
    #[arg(long)]
    output_port: Option<String>,

    /// SysEx device id (0-15), overriding the config
    #[arg(long)]
    device_id: Option<u8>,
}

fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    if args.list_ports {
        discovery::print_ports();
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(port) = args.input_port {
        config.midi.input_port = port;
    }
    if let Some(port) = args.output_port {
        config.midi.output_port = port;
    }
    if let Some(id) = args.device_id {
        config.device_id = id;
    }

    info!(
        "Starting m3combi - output '{}', input '{}', device id {}",
        config.midi.output_port, config.midi.input_port, config.device_id
    );

    let mut output = OutputDevice::new(&config.midi.output_port);
    if let Err(err) = output.open() {
        warn!("{}", err);
        let ports = discovery::output_ports()?;
        match cli::choose_port("output", &ports) {
            Some(index) => output.open_index(index)?,
            None => return Err(err),
        }
    }
    println!("Using output device: {}", output.name().unwrap_or("?"));

    let mut input = InputDevice::new(&config.midi.input_port);
    if let Err(err) = input.open() {
        warn!("{}", err);
        let ports = discovery::input_ports()?;
        match cli::choose_port("input", &ports) {
            Some(index) => input.open_index(index)?,
            None => return Err(err),
        }
    }
    println!("Using input device: {}", input.name().unwrap_or("?"));

    let mut copier = PatchCopier::new(config.device_id, input.registry(), config.timeout());
    copier.set_progress(Arc::new(|_status, _received| {
        print!(".");
        let _ = std::io::stdout().flush();
    }));

    cli::run_repl(&mut copier, &mut output)?;

    println!("Cleaning up . . .");
    input.close();
    output.close();
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                // Keep stdout for the prompt; logs go to stderr.
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(())
}
