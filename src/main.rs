use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleet_dispatch::config::{ConnectionConfig, CoordinatorConfig, MonitorConfig};
use fleet_dispatch::shutdown::install_shutdown_handler;
use fleet_dispatch::Coordinator;

#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch")]
#[command(version)]
#[command(about = "Job dispatch coordinator for a fleet of WebSocket workers")]
struct Args {
    /// Address to bind the worker socket and HTTP API on
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, default_value = "8765")]
    port: u16,

    /// Bearer token accepted from workers (repeatable)
    #[arg(long = "auth-token")]
    auth_tokens: Vec<String>,

    /// Seconds between fleet monitor cycles
    #[arg(long, default_value = "60")]
    monitor_interval_secs: u64,

    /// Seconds a queued job may wait before it counts as starving
    #[arg(long, default_value = "30")]
    starvation_secs: u64,

    /// Seconds before a migrated job may be migrated again
    #[arg(long, default_value = "300")]
    migration_cooldown_secs: u64,

    /// Longest run of same-requester jobs tolerated in a queue
    #[arg(long, default_value = "2")]
    fairness_block: usize,

    /// Close worker connections silent for this many seconds
    #[arg(long, default_value = "120")]
    idle_timeout_secs: u64,
}

impl Args {
    fn into_config(self) -> CoordinatorConfig {
        let monitor = MonitorConfig {
            interval: Duration::from_secs(self.monitor_interval_secs),
            starvation_threshold: Duration::from_secs(self.starvation_secs),
            migration_cooldown: Duration::from_secs(self.migration_cooldown_secs),
            fairness_block_len: self.fairness_block,
        };
        let connection = ConnectionConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ..ConnectionConfig::default()
        };

        let mut config = CoordinatorConfig::new(SocketAddr::new(self.host, self.port))
            .with_monitor(monitor)
            .with_connection(connection);
        for token in self.auth_tokens {
            config = config.with_auth_token(token);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config();
    if config.auth_tokens.is_empty() {
        tracing::warn!("No --auth-token configured, every worker connection will be rejected");
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        tokens = config.auth_tokens.len(),
        monitor_interval_secs = config.monitor.interval.as_secs(),
        starvation_secs = config.monitor.starvation_threshold.as_secs(),
        fairness_block = config.monitor.fairness_block_len,
        "Starting fleet coordinator"
    );

    let shutdown = install_shutdown_handler();
    Arc::new(Coordinator::new(config)).run(shutdown).await?;

    tracing::info!("Coordinator stopped");
    Ok(())
}
