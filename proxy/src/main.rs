use clap::Parser;
use log::info;
use proxy::backend::UdpRelayConnector;
use proxy::config::ProxyConfig;
use proxy::network::ProxyServer;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments. Flags override values from `--config`.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// JSON config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// IP address to bind to
    #[clap(short = 'H', long)]
    host: Option<IpAddr>,
    /// UDP port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// Downstream server address
    #[clap(short, long)]
    backend: Option<SocketAddr>,
    /// Maximum number of concurrent sessions
    #[clap(short, long)]
    max_sessions: Option<usize>,
    /// Tick rate (updates per second)
    #[clap(short, long)]
    tick_rate: Option<u32>,
    /// Log filter used when RUST_LOG is unset
    #[clap(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::load(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(host) = self.host {
            config.bind_address.set_ip(host);
        }
        if let Some(port) = self.port {
            config.bind_address.set_port(port);
        }
        if let Some(backend) = self.backend {
            config.backend_address = backend;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_interval_ms = 1000 / u64::from(tick_rate.max(1));
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = args.into_config()?;
    info!(
        "Relaying to {}, at most {} sessions",
        config.backend_address, config.max_sessions
    );

    let connector = Arc::new(UdpRelayConnector::new(config.backend_address));
    let mut server = ProxyServer::bind(config, connector).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    Ok(())
}
