mod api;
mod auth;
mod config;
mod db;
mod error;
mod metrics;
mod orderer;
mod protocol;
mod rooms;
mod store;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::jwt::{JwtTenantManager, TenantManager},
    config::RelayConfig,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics::RelayMetrics,
    orderer::OrdererManager,
    rooms::RoomHub,
    store::Collaborators,
    ws::GatewayState,
};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_tenant_secret() {
        warn!("using the development tenant secret; set CONCORD_RELAY_TENANT_SECRETS in production");
    }

    let tenants: Arc<dyn TenantManager> = Arc::new(
        JwtTenantManager::new(&config.tenant_secrets).context("invalid relay tenant secrets")?,
    );
    let collaborators = build_collaborators(&config).await?;

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let rooms = Arc::new(RoomHub::new());
    let orderers = Arc::new(
        OrdererManager::from_config(&config, Arc::clone(&rooms))
            .context("failed to configure document orderers")?,
    );

    let gateway = GatewayState {
        tenants: Arc::clone(&tenants),
        collaborators,
        orderers: Arc::clone(&orderers),
        rooms,
        latency_sink: relay_metrics.clone(),
        max_clients_per_document: config.max_clients_per_document,
    };
    let api_state = api::ApiState { orderers: Arc::clone(&orderers), metrics: relay_metrics };
    let app = build_router(gateway, api::router(api_state, tenants));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        orderer = ?config.orderer,
        "starting relay server"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly");

    if let Err(close_error) = orderers.close().await {
        error!(error = %close_error, "failed to close document orderers");
    }

    served
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn build_collaborators(config: &RelayConfig) -> anyhow::Result<Collaborators> {
    let Some(database_url) = config.database_url.as_deref() else {
        info!("CONCORD_RELAY_DATABASE_URL not set, using in-memory collaborators");
        return Ok(Collaborators::memory());
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to create relay database pool")?;
    check_pool_health(&pool).await.context("relay database health check failed")?;
    run_migrations(&pool).await.context("failed to run relay database migrations")?;

    Ok(Collaborators::postgres(pool))
}

fn build_router(gateway: GatewayState, api_router: Router) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(gateway))
            .merge(api_router),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!(error = %signal_error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                error!(error = %signal_error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
