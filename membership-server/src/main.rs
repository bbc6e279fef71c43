//! Membership Server - HTTP server binary for the membership portal
//!
//! Loads configuration from `MEMBERSHIP_CONFIG` and the environment, wires
//! storage, the billing gateway and the webhook processor together, and
//! serves the `/api` routes plus `GET /health`.
//!
//! # Environment
//!
//! - `MEMBERSHIP_CONFIG`: optional TOML config file
//! - `MEMBERSHIP_BIND_ADDR`, `MEMBERSHIP_GATEWAY_MODE`: overrides
//! - `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET`: provider secrets
//! - `LOG_FORMAT`, `RUST_LOG`: logging

#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and axum"
)]

mod observability;

use std::{
    process::ExitCode,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use membership_portal::{
    MembershipService, MemoryStorage, PortalConfig, PortalError,
    api::{self, AppState},
    config::GatewayMode,
    gateway::{BillingGateway, SandboxGateway, StripeGateway},
    security::RateLimiter,
    webhook::{SignatureVerifier, WebhookProcessor},
};
use observability::{HealthReport, HealthStatus, LogFormat, init_observability, portal_checks};
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "membership-server";

#[derive(Debug, Clone)]
struct HealthState {
    service: Arc<MembershipService>,
    webhook_configured: bool,
    started: Instant,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_observability(LogFormat::from_env());

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = PortalConfig::load()?;
    info!(?config, "configuration loaded");

    let storage = MemoryStorage::new(config.catalog()?);
    let gateway = build_gateway(&config)?;
    let service = Arc::new(
        MembershipService::new(Arc::new(storage), gateway)
            .with_currency(&config.currency)
            .with_gateway_timeout(config.gateway.timeout()),
    );

    let verifier = config.webhook_secret.clone().map(|secret| {
        SignatureVerifier::new(secret)
            .with_tolerance(Duration::from_secs(config.webhook.tolerance_secs))
    });
    if verifier.is_none() {
        warn!("STRIPE_WEBHOOK_SECRET is not set; webhook deliveries will be rejected");
    }

    let health = HealthState {
        service: Arc::clone(&service),
        webhook_configured: verifier.is_some(),
        started: Instant::now(),
    };
    let state = AppState {
        webhooks: Arc::new(WebhookProcessor::new(Arc::clone(&service), verifier)),
        limiter: Arc::new(RateLimiter::new(config.rate_limit)),
        service,
    };

    let app = api::router(state)
        .merge(Router::new().route("/health", get(health_handler)).with_state(health));

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    info!("server stopped");
    Ok(())
}

fn build_gateway(config: &PortalConfig) -> Result<Arc<dyn BillingGateway>, PortalError> {
    match config.gateway.mode {
        GatewayMode::Sandbox => {
            warn!("using the sandbox gateway; no real charges will be made");
            Ok(Arc::new(SandboxGateway::new()))
        }
        GatewayMode::Stripe => {
            let secret = config
                .stripe_secret_key
                .clone()
                .ok_or_else(|| PortalError::Config("STRIPE_SECRET_KEY is required".to_owned()))?;
            Ok(Arc::new(StripeGateway::new(&config.gateway.stripe, secret)?))
        }
    }
}

async fn health_handler(State(health): State<HealthState>) -> Response {
    let plans = health.service.list_plans().await.map(|plans| plans.len());
    let checks = portal_checks(plans, health.service.gateway_name(), health.webhook_configured);
    let status = HealthReport::compute_status(&checks);
    let report = HealthReport {
        status,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        service: SERVICE_NAME.to_owned(),
        gateway: health.service.gateway_name().to_owned(),
        uptime_secs: health.started.elapsed().as_secs(),
        checks,
    };

    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    match report.to_json() {
        Ok(body) => (code, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            error!(error = %err, "health report serialization failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
