//! CoilPulse - Modbus Coil Pulse & Sequence Controller
//!
//! Press-and-hold and automated sequences for solenoid pushers wired to
//! Modbus coils, with an HTTP/WebSocket control surface

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use coilpulse::{config, panel};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    print_banner();

    info!("Starting CoilPulse v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::load_config()?;
    info!(
        "Configuration loaded: {} coils configured",
        config.device.coils.len()
    );

    // Connect and build the controller
    let panel = panel::Panel::new(config).await?;

    // Serve until Ctrl+C
    panel.run().await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
    ╔═══════════════════════════════════════════════╗
    ║                                               ║
    ║   CoilPulse                                   ║
    ║   Modbus Coil Pulse & Sequence Controller     ║
    ║                                               ║
    ╚═══════════════════════════════════════════════╝
    "#
    );
}
