mod client;
mod config;

use crate::client::{Incoming, SwitchyardClient};
use crate::config::ClientConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();

    info!("Switchyard Client v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config()?;

    // Connect to server
    let server_addr = format!("{}:{}", config.client.server_addr, config.client.server_port);
    info!("Connecting to server at {}...", server_addr);

    let stream = match tokio::time::timeout(
        Duration::from_secs(config.timeouts.connect_timeout_secs),
        TcpStream::connect(&server_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!("Failed to connect: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("Connection timeout");
            return Err(anyhow::anyhow!("Connection timeout"));
        }
    };

    info!("Connected to {}", server_addr);

    let client = SwitchyardClient::new(
        config.client.encoding,
        config.client.max_frame_bytes,
        config.timeouts.write_timeout_secs,
    );

    let (read_half, mut write_half) = stream.into_split();
    let mut receiver = tokio::spawn(print_incoming(client.clone(), read_half));

    println!("\nSwitchyard Client connected ({:?} encoding).", config.client.encoding);
    println!("Send commands as <namespace>.<code> [arg ...], e.g. chat.join ann");
    println!("Type quit to exit:\n");

    // Interactive command loop
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        print!("> ");
        // Manually flush stdout since print! doesn't auto-flush
        use std::io::Write;
        std::io::stdout().flush()?;

        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => match read {
                Ok(0) => break, // EOF
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = &mut receiver => {
                println!("\nSession ended.");
                return Ok(());
            }
        }

        let input = line.trim();

        if input.is_empty() {
            continue;
        }

        if input == "quit" || input == "exit" {
            info!("Exiting...");
            break;
        }

        let envelope = match client.parse_line(input) {
            Ok(envelope) => envelope,
            Err(e) => {
                println!("[ERROR] {}", e);
                continue;
            }
        };

        if let Err(e) = client.send(&mut write_half, &envelope).await {
            warn!("Send failed: {}", e);
            println!("[ERROR] {}", e);
        }
    }

    receiver.abort();
    Ok(())
}

/// Prints every frame from the server until a close notice or a read error.
async fn print_incoming(client: SwitchyardClient, mut stream: OwnedReadHalf) {
    loop {
        match client.receive(&mut stream).await {
            Ok(Incoming::Message(envelope)) => {
                println!("\n< {}", client.describe(&envelope));
            }
            Ok(Incoming::Closed(notice)) => {
                println!("\n< closed {}: {}", notice.code, notice.reason);
                break;
            }
            Err(e) => {
                debug!("Receive ended: {}", e);
                break;
            }
        }
    }
}

fn load_config() -> anyhow::Result<ClientConfig> {
    // Try configs/client.toml (development)
    if let Ok(config) = ClientConfig::from_file("configs/client.toml") {
        info!("Loaded config from configs/client.toml");
        return Ok(config);
    }

    // Try ./client.toml (current directory)
    if let Ok(config) = ClientConfig::from_file("client.toml") {
        info!("Loaded config from client.toml");
        return Ok(config);
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(ClientConfig::default_config())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
