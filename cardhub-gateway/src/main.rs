use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use cardhub_cluster::{
    ConnectionLimits, ConnectionRegistry, FanoutBus, FanoutConfig, SweepConfig,
};
use cardhub_core::repository::{
    InMemoryMessageStore, InMemoryNotificationStore, InMemoryPreferenceStore, InMemoryUserDirectory,
};
use cardhub_core::service::call::{CallCoordinator, InMemoryCallSessionStore};
use cardhub_core::service::delivery::{DeliveryQueue, QueueConfig};
use cardhub_core::service::email::{Mailer, SmtpMailer};
use cardhub_core::service::TokenValidator;
use cardhub_core::{logging, Config};

use cardhub_gateway::calls::{spawn_presence_watcher, FanoutSignalSink};
use cardhub_gateway::orchestrator::{delivery_handlers, MessageOrchestrator};
use cardhub_gateway::{create_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "cardhub-gateway", about = "Real-time communication gateway")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CARDHUB_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        eprintln!("Using default configuration");
        Config::default()
    });

    logging::init_logging(&config.logging)?;

    info!("Cardhub gateway starting...");
    info!("HTTP address: {}", config.http_address());

    let instance_id = generate_instance_id();
    info!(instance_id = %instance_id, "Instance identity assigned");

    // Connection registry with presence reference counting
    let registry = Arc::new(ConnectionRegistry::new(
        instance_id,
        ConnectionLimits {
            max_per_user: config.presence.max_connections_per_user,
            max_total: config.presence.max_connections_total,
        },
    ));

    // Fanout bus; empty Redis URL runs single-node
    let bus = Arc::new(
        FanoutBus::new(
            FanoutConfig {
                redis_url: config.redis.url.clone(),
                ..FanoutConfig::default()
            },
            registry.clone(),
        )
        .await?,
    );
    info!(
        redis_enabled = bus.metrics().redis_enabled,
        "Fanout bus initialized"
    );

    // Heartbeat sweep: stale channels cannot leave users stuck online
    bus.spawn_sweeper(SweepConfig {
        sweep_interval: Duration::from_secs(config.presence.sweep_interval_seconds),
        heartbeat_timeout: Duration::from_secs(config.presence.heartbeat_timeout_seconds),
        remote_max_age: Duration::from_secs(config.presence.remote_max_age_seconds),
    });

    // Collaborator stores. The in-memory implementations serve
    // single-process deployments; store-backed ones plug in behind the
    // same traits.
    let message_store = Arc::new(InMemoryMessageStore::new());
    let notification_store = Arc::new(InMemoryNotificationStore::new());
    let preference_store = Arc::new(InMemoryPreferenceStore::new());
    let user_directory = Arc::new(InMemoryUserDirectory::new());

    // Delivery queue with per-kind worker pools
    let queue = DeliveryQueue::new(QueueConfig::from(&config.delivery));

    // Email dispatcher, if configured
    let mailer: Option<Arc<dyn Mailer>> = if config.email_configured() {
        match SmtpMailer::new(config.email.clone()) {
            Ok(mailer) => {
                info!(smtp_host = %config.email.smtp_host, "Email dispatcher initialized");
                Some(Arc::new(mailer))
            }
            Err(e) => {
                error!(error = %e, "Failed to initialize email dispatcher");
                None
            }
        }
    } else {
        warn!("Email not configured, email jobs will dead-letter");
        None
    };

    queue
        .start(delivery_handlers(
            message_store.clone(),
            notification_store.clone(),
            preference_store.clone(),
            queue.clone(),
            bus.clone(),
            mailer,
        ))
        .await;
    info!("Delivery queue started");

    // Call signaling coordinator wired to the fanout bus
    let coordinator = CallCoordinator::new(
        Arc::new(InMemoryCallSessionStore::new()),
        Arc::new(FanoutSignalSink::new(bus.clone())),
        Duration::from_secs(config.call.ring_timeout_seconds),
    );
    spawn_presence_watcher(registry.clone(), coordinator.clone());
    info!(
        ring_timeout_seconds = config.call.ring_timeout_seconds,
        "Call coordinator initialized"
    );

    let orchestrator = Arc::new(MessageOrchestrator::new(
        message_store,
        notification_store,
        user_directory,
        queue.clone(),
        bus.clone(),
    ));

    let state = AppState {
        validator: TokenValidator::new(&config.auth.token_secret),
        bus: bus.clone(),
        orchestrator,
        coordinator,
        queue: queue.clone(),
    };

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!("HTTP server listening on {}", config.http_address());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    queue.shutdown();
    bus.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Generate a unique identifier for this server instance
fn generate_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}_{}", host, nanoid::nanoid!(6))
}
