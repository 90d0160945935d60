use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use ara_realtime_gateway::config::Settings;
use ara_realtime_gateway::server::{create_app, AppState};
use ara_realtime_gateway::shutdown::GracefulShutdown;
use ara_realtime_gateway::tasks::MaintenanceTask;
use ara_realtime_gateway::telemetry::init_telemetry;
use ara_realtime_gateway::triggers::RedisSubscriber;
use ara_realtime_gateway::webtransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (and OpenTelemetry when enabled)
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings.clone());
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start Redis subscriber in background
    let redis_handle = if settings.redis.enabled {
        let redis_subscriber = Arc::new(RedisSubscriber::new(
            settings.redis.clone(),
            state.dispatcher.clone(),
        ));
        let redis_shutdown = redis_subscriber.shutdown_signal();
        let mut stop = shutdown_tx.subscribe();
        tokio::spawn(async move {
            // Forward the process-wide signal to the subscriber's own channel
            if stop.recv().await.is_ok() {
                let _ = redis_shutdown.send(());
            }
        });
        Some(tokio::spawn(async move {
            if let Err(e) = redis_subscriber.start().await {
                tracing::error!(error = %e, "Redis subscriber failed");
            }
        }))
    } else {
        tracing::info!("Redis trigger disabled");
        None
    };

    // Start WebTransport listener in background
    let webtransport_handle = if settings.webtransport.enabled {
        let listener_state = state.clone();
        let listener_shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = webtransport::run_listener(listener_state, listener_shutdown).await {
                tracing::error!(error = %e, "WebTransport listener failed");
            }
        }))
    } else {
        tracing::info!("WebTransport listener disabled");
        None
    };

    // Start maintenance task in background
    let maintenance_task = MaintenanceTask::new(state.clone(), shutdown_tx.subscribe());
    let maintenance_handle = tokio::spawn(maintenance_task.run());

    // Create Axum app
    let app = create_app(state.clone());

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // SSE responses never end on their own
    let graceful = GracefulShutdown::new(state.supervisor.clone(), shutdown_tx.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = shutdown_signal().await;
            graceful.execute(reason).await;
        })
        .await?;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = maintenance_handle.await;
    for handle in [redis_handle, webtransport_handle].into_iter().flatten() {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            "interrupt"
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
            "terminate"
        }
    }
}
