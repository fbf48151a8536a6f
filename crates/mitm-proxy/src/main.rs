//! Supervisor (C8): parses the CLI, assembles configuration, installs
//! logging, and drives the connection pump until SIGINT or a fatal
//! initialization failure.
//!
//! Grounded on the teacher crate's binary `main()`s (`ro2-login`,
//! `ro2-lobby`): `tracing_subscriber` init banner, then bind and serve.

use anyhow::Result;
use clap::Parser;
use mitm_proxy::config::Config;
use mitm_proxy::pump::Pump;
use tracing::info;

/// A dual-sided MITM proxy for a Minecraft-style client/server session
/// protocol: completes the encryption handshake with both the real
/// client and the real server, then relays frames between them.
#[derive(Parser, Debug)]
#[command(name = "mitm-proxy", version, about, long_about = None)]
struct Cli {
    /// Real server host to connect to. Overrides config/env if given.
    server_host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.server_host)?;

    info!("==============================================");
    info!("   mitm-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");
    info!(upstream = %config.upstream_host, port = config.listen_port, "configuration loaded");

    let pump = Pump::new(config);
    pump.run().await
}
