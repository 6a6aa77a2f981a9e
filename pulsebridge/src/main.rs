//! Heart-rate relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use pulsebridge::console::{Console, ConsoleExit, ConsoleObserver, prompt_address, stdin_lines};
use pulsebridge::{HttpServer, Relay, RelayConfig};
use pulsebridge_common::init_tracing;

/// Relay a remote heart-rate feed to local WebSocket viewers.
#[derive(Parser, Debug)]
#[command(name = "pulsebridge")]
#[command(about = "Relay a remote heart-rate feed to local WebSocket viewers")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Upstream address, e.g. 192.168.3.168 (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Access code viewers must present (overrides config).
    #[arg(long)]
    access_code: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        RelayConfig::load_from_file(config_path)?
    } else {
        RelayConfig::default()
    };

    // Apply CLI overrides
    if let Some(host) = args.host {
        config.upstream.host = Some(host);
    }
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(access_code) = args.access_code {
        config.server.access_code = access_code;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    let mut stdin = stdin_lines();

    // Without a configured host, ask for one like the interactive tool always did.
    if config.upstream.host.is_none() {
        let mut stdout = std::io::stdout();
        match prompt_address(&mut stdin, &mut stdout, config.upstream.port).await {
            Some(target) => config.upstream.host = Some(target.url()),
            None => anyhow::bail!("No upstream address given"),
        }
    }
    config.validate_complete()?;

    // Initialize logging
    init_tracing(&config.logging)?;

    info!("Starting PulseBridge relay");

    let listen_addr: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Start the relay core
    let relay = Relay::from_config(&config, Arc::new(ConsoleObserver::stdout()))?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start HTTP server
    let http_server = HttpServer::new(
        relay.handle(),
        listen_addr,
        config.server.ws_path.clone(),
        config.server.send_buffer,
    );
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Start console
    let console = Console::new(relay.handle(), std::io::stdout());
    let console_task = tokio::spawn(console.run(stdin));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        exit = console_task => {
            if let Ok(ConsoleExit::Closed) = exit {
                // Stdin is gone (e.g. running as a service); keep relaying until signalled.
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate() => {}
                }
            }
            info!("Shutting down...");
        }
    }

    // Stop the supervisor and close every viewer
    relay.stop().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    info!("Relay stopped");
    Ok(())
}

/// Resolves on SIGTERM (never on platforms without it).
async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
