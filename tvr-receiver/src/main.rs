//! TVR receiver: entry point.
//!
//! ```text
//! tvr-receiver                   Run in the foreground
//! tvr-receiver --config <path>   Load a custom config TOML
//! tvr-receiver --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tvr_receiver::config::ReceiverConfig;
use tvr_receiver::service::ReceiverService;
use tvr_receiver::surfaces::LoggingCapabilities;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tvr-receiver", about = "TVR remote-control receiver service")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tvr-receiver.toml")]
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
        let text = toml::to_string_pretty(&ReceiverConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = ReceiverConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tvr-receiver v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "control: {}:{} (max {} remotes)",
        config.network.bind, config.network.control_port, config.network.max_connections
    );
    info!("TLS: {}", if config.tls_enabled() { "on" } else { "off" });

    let service = ReceiverService::new(config)?;
    service.capabilities().bind(Arc::new(LoggingCapabilities));
    info!("certificate fingerprint: {}", service.pairing().fingerprint());

    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
