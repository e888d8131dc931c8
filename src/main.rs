use clap::Parser;
use ddalab_relay::{
    cli::{Cli, Commands},
    create_router, RelayConfig, RelayError, RelayState, SessionContext, SessionTracker,
    SourceRegistry, TransportKind,
};
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ddalab_relay=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let mut config = RelayConfig::from_env()?;

    match cli.command {
        Some(Commands::Sources { transport }) => {
            apply_transport(&mut config, transport);
            list_sources(&config).await
        }
        Some(Commands::Serve {
            port,
            bind,
            transport,
        }) => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            apply_transport(&mut config, transport);
            serve(config).await
        }
        None => serve(config).await,
    }
}

fn apply_transport(config: &mut RelayConfig, transport: Option<TransportKind>) {
    if let Some(transport) = transport {
        config.transport = transport;
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!("🚀 Starting DDALAB Relay v{}", VERSION);

    let transport = config.build_transport()?;
    info!("   Transport: {}", transport.name());
    info!(
        "   Buffer: {} samples, window: {}s, retry every {:?}",
        config.buffer_size, config.window_seconds, config.retry_interval
    );

    let context = SessionContext {
        transport,
        config: config.session_config(),
        tracker: SessionTracker::new(),
    };

    if !config.allows_any_origin() {
        info!("   CORS origins: {:?}", config.cors_origins);
    }
    let app = create_router(RelayState::new(context), &config.cors_origins);

    let addr: SocketAddr = config.bind_address().parse()?;
    info!("🎧 Listening on {}", addr);
    info!("📡 WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Relay stopped");
    Ok(())
}

async fn list_sources(config: &RelayConfig) -> anyhow::Result<()> {
    let transport = config.build_transport()?;
    let registry = SourceRegistry::new(transport, config.discovery_timeout);

    let sources = match registry.list_sources().await {
        Ok(sources) => sources,
        Err(RelayError::NoSourcesFound) => {
            println!("No streams available.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{:<28} {:<12} {:<7} {:<28} {:>8} {:>10}",
        "NAME", "TYPE", "KIND", "SOURCE ID", "CHANNELS", "RATE (Hz)"
    );
    for source in &sources {
        println!(
            "{:<28} {:<12} {:<7} {:<28} {:>8} {:>10}",
            source.name,
            source.source_type,
            format!("{:?}", source.kind()).to_lowercase(),
            source.source_id,
            source
                .channel_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            source
                .sampling_rate
                .map(|r| format!("{:.1}", r))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
