//! VolKnob GW - volume knob to speaker manager bridge.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use volknob_gw::bridge::{Bridge, Collaborators};
use volknob_gw::config::AppConfig;
use volknob_gw::device::hid::HidKnob;
use volknob_gw::logging;
use volknob_gw::proto::{self, MidiTransport};

/// VolKnob Gateway - drive a speaker manager app from a USB volume knob
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Directory for rolling log files (console-only when omitted)
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// List available MIDI output ports
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    if args.list_ports {
        proto::print_output_ports();
        return Ok(());
    }

    let _log_guard = logging::init(&args.log_level, args.log_dir.as_deref())?;

    info!("Starting VolKnob GW...");
    info!("Configuration file: {}", args.config.display());

    let config = AppConfig::load(&args.config).await?;

    let device = HidKnob::new(
        config.device.vid,
        config.device.pid,
        config.device.read_timeout_ms as i32,
    )
    .context("failed to initialize HID")?;

    let transport = MidiTransport::new(config.midi.output_port.clone(), config.midi.channel);

    let collaborators = Collaborators {
        device: Box::new(device),
        transport: Box::new(transport),
        process: platform_process_control(),
        sampler: platform_sampler(),
        ui: platform_ui(),
    };

    let bridge = Bridge::new(config);
    bridge.run(collaborators, shutdown_signal()).await?;

    info!("VolKnob GW shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install CTRL+C signal handler: {e}");
        // Without a signal handler there is no clean way down; park
        // forever and let the service manager kill us.
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(windows)]
fn platform_process_control() -> Option<Arc<dyn volknob_gw::process::ProcessControl>> {
    Some(Arc::new(
        volknob_gw::platform::windows::WinProcessControl::new(),
    ))
}

#[cfg(not(windows))]
fn platform_process_control() -> Option<Arc<dyn volknob_gw::process::ProcessControl>> {
    None
}

#[cfg(windows)]
fn platform_sampler() -> Option<Arc<dyn volknob_gw::automation::VisualSampler>> {
    Some(Arc::new(volknob_gw::platform::windows::GdiSampler))
}

#[cfg(not(windows))]
fn platform_sampler() -> Option<Arc<dyn volknob_gw::automation::VisualSampler>> {
    None
}

#[cfg(windows)]
fn platform_ui() -> Option<Arc<dyn volknob_gw::automation::UiInteraction>> {
    Some(Arc::new(volknob_gw::platform::windows::SendInputUi))
}

#[cfg(not(windows))]
fn platform_ui() -> Option<Arc<dyn volknob_gw::automation::UiInteraction>> {
    None
}
