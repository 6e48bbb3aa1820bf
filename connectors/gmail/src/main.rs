use anyhow::Result;
use dashmap::DashSet;
use dotenvy::dotenv;
use shared::db::repositories::{
    ConnectionRepository, EmailRepository, WatchSubscriptionRepository,
};
use shared::telemetry::{self, TelemetryConfig};
use shared::DatabasePool;
use std::sync::Arc;
use tracing::{error, info};

use txmail_gmail_connector::api::{create_router, ApiState};
use txmail_gmail_connector::config::GmailConnectorConfig;
use txmail_gmail_connector::scheduler::Scheduler;
use txmail_gmail_connector::{EngineDeps, ExtractionClient, GmailClient, SyncEngine};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let telemetry_config = TelemetryConfig::from_env("txmail-gmail-connector");
    telemetry::init_telemetry(telemetry_config)?;

    info!("Starting Gmail connector");

    let config = GmailConnectorConfig::from_env();

    let db_pool = DatabasePool::from_config(&config.database).await?;
    db_pool.migrate().await?;
    let pool = db_pool.pool();

    let provider = Arc::new(GmailClient::with_endpoints(
        config.google_client_id.clone(),
        config.google_client_secret.clone(),
        config.gmail_api_base_url.clone(),
        config.google_token_url.clone(),
    )?);
    let connections = Arc::new(ConnectionRepository::new(pool));
    let processor = Arc::new(ExtractionClient::new(config.extraction_service_url.clone())?);

    let engine = SyncEngine::new(
        EngineDeps {
            provider,
            connections: connections.clone(),
            subscriptions: Arc::new(WatchSubscriptionRepository::new(pool)),
            emails: Arc::new(EmailRepository::new(pool)),
            processor,
        },
        config.engine_options(),
    );
    let active_syncs = Arc::new(DashSet::new());

    let scheduler = Arc::new(Scheduler::new(
        engine.executor.clone(),
        engine.watches.clone(),
        Arc::clone(&active_syncs),
        config.auto_sync_tick_seconds,
        config.watch_renewal_interval_seconds,
    ));
    let auto_sync_scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move { auto_sync_scheduler.run_auto_sync().await });
    let renewal_scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move { renewal_scheduler.run_watch_renewal().await });

    let api_state = ApiState {
        connections,
        history: engine.history.clone(),
        executor: engine.executor.clone(),
        watches: engine.watches.clone(),
        migration: engine.migration.clone(),
        monitor: engine.monitor.clone(),
        active_syncs,
    };

    let app = create_router(api_state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("HTTP server listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("HTTP server stopped: {:?}", e);
    }

    db_pool.close().await;
    telemetry::shutdown_telemetry().await;
    Ok(())
}
