//! HTTP surface under `/api`.
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /api/membership-plans` | [`handlers::list_plans`] |
//! | `GET /api/membership-plans/{id}` | [`handlers::get_plan`] |
//! | `POST /api/payments` | [`handlers::create_payment`] |
//! | `GET /api/payments/{id}` | [`handlers::get_payment`] |
//! | `GET /api/membership/{email}` | [`handlers::get_membership`] |
//! | `POST /api/membership/{membershipId}/change-plan` | [`handlers::change_plan`] |
//! | `POST /api/membership/{membershipId}/cancel` | [`handlers::cancel_membership`] |
//! | `POST /api/webhook` | [`handlers::webhook`] |

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{lifecycle::MembershipService, security::RateLimiter, webhook::WebhookProcessor};

mod error;
pub mod handlers;

pub use error::ApiError;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Lifecycle operations.
    pub service: Arc<MembershipService>,
    /// Provider event intake.
    pub webhooks: Arc<WebhookProcessor>,
    /// Limits the routes that reach the billing provider.
    pub limiter: Arc<RateLimiter>,
}

/// Builds the `/api` router with request tracing.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/membership-plans", get(handlers::list_plans))
        .route("/membership-plans/{id}", get(handlers::get_plan))
        .route("/payments", post(handlers::create_payment))
        .route("/payments/{id}", get(handlers::get_payment))
        .route("/membership/{email}", get(handlers::get_membership))
        .route("/membership/{membership_id}/change-plan", post(handlers::change_plan))
        .route("/membership/{membership_id}/cancel", post(handlers::cancel_membership))
        .route("/webhook", post(handlers::webhook))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}
