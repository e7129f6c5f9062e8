use anyhow::Context;
use clap::Parser;
use fleetsync_hub::{
    config::HubConfig,
    inventory::FileTopologyProvider,
    logging::{self, LogOverrides, LogSettings},
    server::{self, ServerConfig},
    Hub,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fleetsync-hub", about = "Fleet topology sync hub")]
struct Args {
    #[arg(long, env = "FLEETSYNC_ADDR", default_value = "127.0.0.1:7420")]
    addr: String,
    #[arg(long, env = "FLEETSYNC_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "FLEETSYNC_INVENTORY", default_value = "inventory.json")]
    inventory: PathBuf,
    #[arg(long, env = "FLEETSYNC_DEBUG")]
    debug: bool,
    #[arg(long, env = "FLEETSYNC_LOG_LEVEL")]
    log_level: Option<String>,
    #[arg(long, env = "FLEETSYNC_LOG_DIR")]
    log_dir: Option<String>,
    /// Seconds between websocket pings.
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    /// Seconds allowed for one outbound frame.
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let hub_config = match HubConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err}");
            std::process::exit(2);
        }
    };
    logging::init(&LogSettings::resolve(
        &hub_config.logging,
        &LogOverrides {
            debug: args.debug,
            level: args.log_level.clone(),
            dir: args.log_dir.clone(),
        },
    ));
    if let Err(err) = run(args, hub_config).await {
        error!(event = "hub_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(args: Args, hub_config: HubConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = args
        .addr
        .parse()
        .with_context(|| format!("invalid addr {}", args.addr))?;
    if !addr.ip().is_loopback() && !hub_config.allow_remote {
        anyhow::bail!("refusing non-loopback addr {addr} without allow_remote");
    }

    let provider = Arc::new(FileTopologyProvider::new(args.inventory.clone()));
    let hub = Arc::new(Hub::new(&hub_config, provider));
    let server_config = ServerConfig {
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        allow_remote: hub_config.allow_remote,
        debug: args.debug,
        ..ServerConfig::default()
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        event = "hub_start",
        addr = %addr,
        inventory = %args.inventory.display(),
        automatic_interval = hub.controller().current_interval()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    server::serve(listener, hub, server_config, shutdown)
        .await
        .context("serving")?;
    info!(event = "hub_stop");
    Ok(())
}
