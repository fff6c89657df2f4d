//! x402 facilitator HTTP entrypoint.
//!
//! Launches the Axum server exposing the facilitator surface:
//! - `GET  /api/info` – Service metadata
//! - `GET  /health` – Per-network RPC health
//! - `GET  /supported` – Supported payment kinds (version/scheme/network)
//! - `POST /verify` – Verify a payment header against requirements
//! - `POST /settle` – Settle an accepted payment on-chain
//!
//! Also starts the finality confirmer when a transaction store is
//! configured. Environment is loaded from `.env`; a bootstrap failure
//! (malformed configuration, signing key, or bind failure) exits with
//! code 1.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use x402_facilitator::config::Config;
use x402_facilitator::confirmer::FinalityConfirmer;
use x402_facilitator::handlers::{self, AppState};
use x402_facilitator::idempotency::IdempotencyCache;
use x402_facilitator::identity::{IdentityAnchor, LocalEvidenceAnchor};
use x402_facilitator::rate_limit::FixedWindowLimiter;
use x402_facilitator::registry::Registry;
use x402_facilitator::settle::Settler;
use x402_facilitator::store::{PgTransactionStore, TransactionStore};
use x402_facilitator::telemetry;
use x402_facilitator::verify::Verifier;

/// Token cancelled on SIGTERM or SIGINT. The HTTP server and the finality
/// confirmer drain against the same token.
fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        trigger.cancel();
    });
    Ok(token)
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });
    telemetry::init(&config.log_level);

    let registry = Registry::from_config(&config).unwrap_or_else(|e| {
        tracing::error!("Failed to build network registry: {e}");
        std::process::exit(1);
    });
    let registry = Arc::new(registry);

    let store: Option<Arc<dyn TransactionStore>> = match &config.database_url {
        Some(database_url) => match PgTransactionStore::connect(database_url).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::error!("Failed to connect to transaction store: {e}");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("No DATABASE_URL configured; finality confirmer disabled");
            None
        }
    };

    let anchor: Option<Arc<dyn IdentityAnchor>> = config
        .chaoschain_enabled
        .then(|| Arc::new(LocalEvidenceAnchor) as Arc<dyn IdentityAnchor>);

    let settler = Settler::new(
        registry.clone(),
        store.clone(),
        config.treasury_address,
        anchor,
    );
    let state = Arc::new(AppState {
        registry: registry.clone(),
        verifier: Verifier::new(registry.clone()),
        settler,
        idempotency: IdempotencyCache::new(config.idempotency_ttl),
        limiter: FixedWindowLimiter::new(config.rate_limit),
        mode: config.mode,
        default_chain: config.default_chain,
    });

    let shutdown = shutdown_token().unwrap_or_else(|e| {
        tracing::error!("Failed to register signal handlers: {e}");
        std::process::exit(1);
    });

    if let Some(store) = store {
        let confirmer = FinalityConfirmer::new(registry.clone(), store);
        confirmer.spawn(shutdown.clone());
    }

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let axum_graceful_shutdown = async move { shutdown.cancelled().await };
    if let Err(e) = axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await
    {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }
}
