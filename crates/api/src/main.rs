use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loregen_api::config::ServerConfig;
use loregen_api::router::build_app_router;
use loregen_api::state::AppState;
use loregen_engine::stub::stub_collaborators;
use loregen_engine::{FlowService, FlowServiceConfig};
use loregen_events::FlowEventBus;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "loregen_api=debug,loregen_engine=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Event bus ---
    let event_bus = Arc::new(FlowEventBus::default());

    // Log every flow event; a real deployment would forward these to
    // clients instead.
    let mut event_rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!(
                event_type = %event.event_type,
                flow_id = %event.flow_id,
                stage = event.stage.as_deref().unwrap_or("-"),
                "flow event"
            );
        }
    });

    // --- Orchestrator ---
    // Stub collaborators: deterministic in-process generation. Swap in
    // real implementations here to talk to external services.
    let service = Arc::new(FlowService::new(
        stub_collaborators(),
        Arc::clone(&event_bus),
        FlowServiceConfig {
            max_concurrent_flows: config.max_concurrent_flows,
            ..FlowServiceConfig::default()
        },
    ));
    service.start().await;
    tracing::info!(
        max_concurrent_flows = config.max_concurrent_flows,
        "Flow service started"
    );

    // --- App state and router ---
    let state = AppState {
        service: Arc::clone(&service),
        config: Arc::new(config.clone()),
    };
    let app = build_app_router(state, &config);

    // --- Serve ---
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT combination");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind server address");
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Drain the orchestrator before exit.
    service.stop().await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received");
}
