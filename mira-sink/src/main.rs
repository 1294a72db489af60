//! Mira sink entry point.
//!
//! ```text
//! mira-sink                  Run in the foreground
//! mira-sink --config <path>  Load a custom config TOML
//! mira-sink --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mira_sink::config::SinkConfig;
use mira_sink::service::SinkService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mira-sink", about = "Screen-mirroring receiver")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "mira-sink.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", SinkConfig::default_toml()?);
        return Ok(());
    }

    let config = SinkConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mira-sink v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "control port: {}, data port: {}",
        config.network.control_port, config.network.data_port
    );
    info!("state dir: {}", config.device.state_dir.display());

    let service = SinkService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
