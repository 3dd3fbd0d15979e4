use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xiaozhi_server::transport::mqtt_udp::{MqttUdpAdapter, UdpServer};
use xiaozhi_server::{ServerConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // Handle CLI arguments
    let mut config_path: Option<PathBuf> = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().ok_or_else(|| anyhow!("--config requires a file path"))?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("Unknown argument '{other}'. Usage: xiaozhi-server [-c <config.yaml>]"),
        }
    }

    // Load configuration
    let config = match &config_path {
        Some(path) => ServerConfig::from_file(path),
        None => ServerConfig::from_env(),
    }
    .map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();

    // Create application state and start background services
    let app_state = AppState::new(config.clone()).await;
    let core = app_state.core_state.clone();
    core.start().await;

    // MQTT signaling with UDP audio
    let _mqtt = if config.mqtt.enabled {
        let udp_address: SocketAddr = config
            .udp_address()
            .parse()
            .with_context(|| format!("Invalid UDP listen address {}", config.udp_address()))?;
        let udp = UdpServer::bind(udp_address, core.shutdown.clone())
            .await
            .with_context(|| format!("Failed to bind UDP {udp_address}"))?;
        let adapter = MqttUdpAdapter::start(
            &config.mqtt,
            udp,
            core.sessions.transport_handler(),
            core.shutdown.clone(),
        )?;
        info!(udp = %udp_address, broker = %config.mqtt.broker, "MQTT+UDP transport enabled");
        Some(adapter)
    } else {
        info!("MQTT disabled; devices connect over WebSocket only");
        None
    };

    let app = routes::create_router(app_state);

    // Create listener
    let listener = TcpListener::bind(&address).await?;
    info!("Server listening on {address}");

    // Start server
    let shutdown = core.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                    }
                    info!("Shutdown requested");
                }
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    core.shutdown().await;
    Ok(())
}
