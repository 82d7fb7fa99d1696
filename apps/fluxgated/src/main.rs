use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use fluxgate_delivery::{
    gateway_router, AuthHeaderBuilder, DeliveryExecutor, DeliveryPipeline, DeliveryWorker,
    DlqService, EventIntake, GatewayState, InMemoryCounterStore, InMemoryDlqStore,
    InMemoryIntegrationStore, InMemoryLogStore, InMemoryPendingStore, ProviderRegistry,
    RateLimiter, Scheduler, Transformer,
};
use fluxgate_script::ScriptSandbox;

mod config;

use config::DaemonConfig;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fluxgate_delivery=debug")),
        )
        .init();

    // Load configuration
    let config = DaemonConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    tracing::info!(
        listen_addr = %config.listen_addr,
        worker_concurrency = config.worker.concurrency,
        "starting fluxgate gateway"
    );

    // Stores (in-memory; external store backends plug in behind the traits)
    let integrations = Arc::new(InMemoryIntegrationStore::new());
    let log_store = Arc::new(InMemoryLogStore::new());
    let dlq_store = Arc::new(InMemoryDlqStore::new());
    let pending_store = Arc::new(InMemoryPendingStore::new());

    // Core components
    let sandbox = Arc::new(ScriptSandbox::new());
    let transformer = Arc::new(Transformer::new(sandbox.clone()));
    let scheduler = Arc::new(Scheduler::new(sandbox));
    let executor = Arc::new(
        DeliveryExecutor::new()
            .unwrap_or_else(|e| {
                eprintln!("HTTP client error: {e}");
                std::process::exit(1);
            })
            .with_providers(ProviderRegistry::new()),
    );
    let auth = Arc::new(AuthHeaderBuilder::new(executor.client().clone()));
    let rate_limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryCounterStore::new())));

    let pipeline = Arc::new(DeliveryPipeline::new(
        integrations.clone(),
        transformer.clone(),
        auth.clone(),
        rate_limiter,
        executor.clone(),
        log_store.clone(),
        dlq_store.clone(),
    ));

    let dlq_service = Arc::new(DlqService::new(dlq_store, pipeline.clone()));
    let intake = Arc::new(EventIntake::new(
        integrations.clone(),
        pipeline.clone(),
        scheduler.clone(),
        pending_store.clone(),
    ));

    // Background worker for deferred deliveries
    let worker = Arc::new(DeliveryWorker::new(
        pending_store.clone(),
        integrations.clone(),
        pipeline.clone(),
        config.worker.clone(),
    ));
    let worker_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // Operator API
    let state = GatewayState {
        integrations,
        pipeline,
        intake,
        dlq_service,
        scheduler,
        transformer,
        auth,
        executor,
        log_store,
        pending_store,
    };
    let app = gateway_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Bind error on {}: {e}", config.listen_addr);
            std::process::exit(1);
        });

    tracing::info!(listen_addr = %config.listen_addr, "operator API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        });

    // Drain in-flight deferred deliveries before exiting
    worker.shutdown();
    let _ = worker_handle.await;
    tracing::info!("fluxgate gateway stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
