//! The server launcher.
//!
//! Boots a context from the storage directory and runs the three
//! endpoints until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webrocket::config::{ServerConfig, DEFAULT_STORAGE_DIR};
use webrocket::{AdminEndpoint, BackendEndpoint, Context, WebsocketEndpoint};

#[derive(Debug, Parser)]
#[command(name = "webrocket-server", version, about = "WebRocket broker server")]
struct Args {
    /// WebSocket endpoint address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    websocket_addr: std::net::SocketAddr,

    /// Backend endpoint address.
    #[arg(long, default_value = "0.0.0.0:8081")]
    backend_addr: std::net::SocketAddr,

    /// Admin endpoint address.
    #[arg(long, default_value = "0.0.0.0:8082")]
    admin_addr: std::net::SocketAddr,

    /// Path to the server certificate (PEM). Enables TLS on the
    /// websocket and backend endpoints.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to the certificate's private key (PEM).
    #[arg(long)]
    key: Option<PathBuf>,

    /// Name of the node. Defaults to the host name.
    #[arg(long)]
    node_name: Option<String>,

    /// Path to the broker's internal data store.
    #[arg(long, default_value = DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            websocket_addr: self.websocket_addr,
            backend_addr: self.backend_addr,
            admin_addr: self.admin_addr,
            cert: self.cert,
            key: self.key,
            node_name: self.node_name,
            storage_dir: self.storage_dir,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = Args::parse().into_config();
    let tls = config.tls_acceptor()?;

    let mut ctx = Context::new();
    ctx.set_storage_dir(&config.storage_dir)
        .context("failed to prepare storage dir")?;
    if let Some(name) = &config.node_name {
        ctx.set_node_name(name);
    }
    ctx.lock().context("failed to lock storage dir")?;
    ctx.load().context("failed to load state")?;
    ctx.generate_cookie(false)
        .context("failed to set up cookie")?;

    info!(
        version = webrocket::VERSION,
        node = %ctx.node_name(),
        "starting webrocket"
    );

    let ctx = Arc::new(ctx);
    let backend = BackendEndpoint::bind(Arc::clone(&ctx), config.backend_addr, tls.clone())
        .await
        .context("failed to bind backend endpoint")?;
    let websocket = WebsocketEndpoint::bind(Arc::clone(&ctx), config.websocket_addr, tls)
        .await
        .context("failed to bind websocket endpoint")?;
    let admin = AdminEndpoint::bind(Arc::clone(&ctx), config.admin_addr)
        .await
        .context("failed to bind admin endpoint")?;

    let scheme = if config.cert.is_some() { "wss" } else { "ws" };
    println!("Websocket endpoint : {}://{}", scheme, config.websocket_addr);
    println!("Backend endpoint   : wr://{}", config.backend_addr);
    println!("Admin endpoint     : http://{}", config.admin_addr);
    println!("Cookie             : {}", ctx.cookie());

    let tasks = [
        tokio::spawn(backend.run()),
        tokio::spawn(websocket.run()),
        tokio::spawn(admin.run()),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    info!("interrupted, shutting down");
    ctx.kill();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
