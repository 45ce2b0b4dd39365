//! castellan - multi-tenant IAM backend
//!
//! Event-sourced identity backend: every state change is an event in an
//! append-only log; read models are projections over that log; OAuth/OIDC
//! flows are aggregates of their own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use castellan::api::{self, AppState};
use castellan::command::{CommandConfig, Commands};
use castellan::config::Config;
use castellan::event_store::PostgresEventStore;
use castellan::oauth::dpop::DpopValidator;
use castellan::oauth::grants::GrantHandler;
use castellan::oauth::tokens::TokenEngine;
use castellan::projection::{
    ApplicationsProjection, AuthRequestsProjection, DeviceAuthsProjection, IdpsProjection,
    OrgsProjection, PgCheckpoints, Projection, Projector, ProjectorConfig, ProjectsProjection,
    TokensProjection, UsersProjection,
};
use castellan::query::Queries;
use castellan::{db, AppError};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castellan=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    tracing::info!(environment = %config.environment, "Starting castellan");

    let pool = db::connect(&config).await?;
    db::verify_connection(&pool).await?;
    db::init_schema(&pool).await?;
    tracing::info!("Event store schema ready");

    let store = Arc::new(PostgresEventStore::new(pool.clone()));
    let commands = Commands::new(store.clone(), CommandConfig::from(&config));

    let dpop = Arc::new(DpopValidator::new());
    let sweeper = dpop
        .replay_cache
        .clone()
        .start_sweeper(Duration::from_secs(60));

    let engine = TokenEngine::new(commands.clone(), &config.issuer, &config.token_signing_key);
    let grants = GrantHandler::new(commands.clone(), engine, dpop);

    let projections: Vec<Arc<dyn Projection>> = vec![
        Arc::new(UsersProjection::new(pool.clone())),
        Arc::new(OrgsProjection::new(pool.clone())),
        Arc::new(ProjectsProjection::new(pool.clone())),
        Arc::new(ApplicationsProjection::new(pool.clone())),
        Arc::new(AuthRequestsProjection::new(pool.clone())),
        Arc::new(DeviceAuthsProjection::new(pool.clone())),
        Arc::new(TokensProjection::new(pool.clone())),
        Arc::new(IdpsProjection::new(pool.clone())),
    ];
    let projector = Projector::new(
        store.clone(),
        Arc::new(PgCheckpoints::new(pool.clone())),
        projections,
        ProjectorConfig {
            interval: Duration::from_millis(config.projection_interval_ms),
            ..Default::default()
        },
    );
    projector
        .init()
        .await
        .map_err(|err| AppError::Fatal(err.to_string()))?;
    let workers = projector.start();
    tracing::info!(workers = workers.len(), "Projection runtime started");

    let state = AppState {
        commands,
        grants,
        queries: Queries::new(pool.clone()),
        projector: projector.clone(),
        issuer: config.issuer.clone(),
    };
    let router = api::create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(addr = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    projector.stop();
    sweeper.abort();
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Cannot listen for shutdown signal");
    }
}
