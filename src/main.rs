//! hearthd - Home Automation Control Plane
//!
//! Main entry point.

use hearthd::{supervisor, web_api, AppConfig};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearthd=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting hearthd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        bus = %format!("{}:{}", config.bus_host, config.bus_port),
        http = %format!("{}:{}", config.host, config.port),
        source_root = %config.source_root.display(),
        "Configuration loaded"
    );

    // Start components in dependency order
    let (state, supervisor) = supervisor::start(config).await?;

    // Create router
    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Interrupt received");
        })
        .await?;

    // Reverse-order drain once the HTTP surface is down
    supervisor.shutdown().await;

    Ok(())
}
