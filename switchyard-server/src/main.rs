mod chat;
mod config;
mod handler;
mod timers;
mod transport;

use crate::chat::ServerInfo;
use crate::config::{ServerConfig, Transport};
use crate::handler::ConnectionHandler;
use crate::timers::TokioTimers;
use std::sync::Arc;
use switchyard_proto::TimerBackend;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config);

    info!("Switchyard Server v{} starting...", env!("CARGO_PKG_VERSION"));

    // Build the protocol once; every connection shares it read-only
    let protocol = chat::build_protocol(config.protocol.encoding, &config.commands)?;

    let server_info = Arc::new(ServerInfo::new(env!("CARGO_PKG_VERSION")));
    let timers: Arc<dyn TimerBackend> = Arc::new(TokioTimers::new(Handle::current()));

    let handler = Arc::new(ConnectionHandler::new(protocol, server_info, timers, &config));

    // Create connection limit semaphore
    let connection_semaphore = Arc::new(Semaphore::new(config.limits.max_conns));

    // Bind to listen address
    let listen_addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&listen_addr).await?;

    info!("Listening on {} ({:?})", listen_addr, config.server.transport);
    info!(
        "Encoding: {:?}, strict: {}",
        config.protocol.encoding, config.protocol.strict
    );
    info!("Maximum concurrent connections: {}", config.limits.max_conns);

    let transport = config.server.transport;

    // Accept connections
    loop {
        // Acquire connection slot
        let permit = connection_semaphore.clone().acquire_owned().await?;

        // Accept connection
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let remote_addr_str = remote_addr.to_string();
        let handler = handler.clone();

        // Spawn connection handler
        tokio::spawn(async move {
            match transport {
                Transport::Tcp => handler.handle_stream(stream, remote_addr_str).await,
                Transport::Websocket => handler.handle_websocket(stream, remote_addr_str).await,
            }
            drop(permit); // Release connection slot
        });
    }
}

fn load_config() -> anyhow::Result<ServerConfig> {
    // Try to load from /etc/switchyard/server.toml first (production)
    if let Ok(config) = ServerConfig::from_file("/etc/switchyard/server.toml") {
        info!("Loaded config from /etc/switchyard/server.toml");
        return Ok(config);
    }

    // Try configs/server.toml (development)
    if let Ok(config) = ServerConfig::from_file("configs/server.toml") {
        info!("Loaded config from configs/server.toml");
        return Ok(config);
    }

    // Try ./server.toml (current directory)
    if let Ok(config) = ServerConfig::from_file("server.toml") {
        info!("Loaded config from server.toml");
        return Ok(config);
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(ServerConfig::default_config())
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));

    if config.logging.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
}
