//! mailverify HTTP server entry point.
//!
//! Serves the verification endpoints and publishes delivery jobs. Emails are
//! sent by the separate `mailverify-worker` process.

use std::net::SocketAddr;
use std::sync::Arc;

use mailverify_api::{AppState, app};
use mailverify_common::Config;
use mailverify_core::{DeliveryService, VerificationService};
use mailverify_db::repositories::{AccountRepository, VerificationTokenRepository};
use mailverify_queue::{JobPublisher, SchedulerConfig, run_scheduler, shutdown_signal};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailverify=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting mailverify server...");

    // Load configuration
    let config = Config::load()?;

    // Connect to database
    let db = mailverify_db::init(&config).await?;
    info!("Connected to database");

    info!("Running database migrations...");
    mailverify_db::migrate(&db).await?;
    info!("Migrations completed");

    if config.queue.url.is_none() {
        warn!("queue.url is not configured, resend requests will fail until it is set");
    }

    // The broker connection is opened on the first publish
    let delivery: DeliveryService = Arc::new(JobPublisher::new(config.queue.clone()));

    let db = Arc::new(db);
    let verification_service = VerificationService::new(
        Arc::new(AccountRepository::new(Arc::clone(&db))),
        Arc::new(VerificationTokenRepository::new(Arc::clone(&db))),
        delivery,
        config.verification.token_ttl(),
    );

    // Background maintenance
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handles = run_scheduler(
        SchedulerConfig {
            token_sweep_interval: config.verification.sweep_interval(),
        },
        Arc::new(verification_service.clone()),
        shutdown_rx,
    );

    let router = app(AppState::new(verification_service));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in scheduler_handles {
        let _ = handle.await;
    }

    info!("Server shutdown complete");
    Ok(())
}
