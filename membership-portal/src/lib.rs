//! Membership Portal: plan checkout, lookup and prorated plan changes
//!
//! A small billing backend that sells time-boxed memberships from a fixed
//! plan catalog. Purchases create a recurring charge at the billing provider,
//! plan changes are prorated against the time left on the current window, and
//! provider webhooks keep stored payment state in step with invoices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   HTTP client    │  checkout form, account page
//! └────────┬─────────┘
//!          │ JSON under /api
//! ┌────────▼──────────────────────────────────────────┐
//! │              membership-portal (this crate)       │
//! │  ┌───────────┐   ┌──────────────────┐             │
//! │  │    api    │───│ MembershipService │──┐         │
//! │  └─────┬─────┘   └────────┬─────────┘  │         │
//! │        │ webhook          │ Storage    │ Billing │
//! │  ┌─────▼──────────┐ ┌─────▼────────┐ ┌─▼───────┐ │
//! │  │WebhookProcessor│ │MemoryStorage │ │ Gateway │ │
//! │  └────────────────┘ └──────────────┘ └─┬───────┘ │
//! └────────────────────────────────────────┼─────────┘
//!                                          │ HTTPS (form-encoded)
//!                                 ┌────────▼────────┐
//!                                 │ billing provider│
//!                                 └─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use membership_portal::{
//!     MembershipService, MemoryStorage,
//!     checkout::PurchaseRequest,
//!     gateway::SandboxGateway,
//!     models::PlanId,
//! };
//! use rust_decimal::Decimal;
//!
//! # async fn example() -> membership_portal::Result<()> {
//! let service = MembershipService::new(
//!     Arc::new(MemoryStorage::default()),
//!     Arc::new(SandboxGateway::new()),
//! );
//!
//! let request = PurchaseRequest {
//!     plan_id: Some(1),
//!     amount: Some(Decimal::new(999, 2)),
//!     cardholder_name: Some("Ada Lovelace".to_owned()),
//!     email: Some("ada@example.com".to_owned()),
//!     card_number: None,
//!     expiry_date: None,
//!     cvc: None,
//! };
//! let outcome = service.purchase(request.validate()?).await?;
//! assert_eq!(outcome.plan.id, PlanId(1));
//!
//! let found = service.lookup_by_email("ada@example.com").await?;
//! assert_eq!(found.membership.id, outcome.membership.id);
//! # Ok(())
//! # }
//! ```
//!
//! # Serving the API
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use membership_portal::{
//!     MembershipService, MemoryStorage,
//!     api::{self, AppState},
//!     gateway::SandboxGateway,
//!     security::{RateLimitConfig, RateLimiter},
//!     webhook::WebhookProcessor,
//! };
//!
//! # async fn example() -> std::io::Result<()> {
//! let service = Arc::new(MembershipService::new(
//!     Arc::new(MemoryStorage::default()),
//!     Arc::new(SandboxGateway::new()),
//! ));
//! let state = AppState {
//!     webhooks: Arc::new(WebhookProcessor::new(Arc::clone(&service), None)),
//!     limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
//!     service,
//! };
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! axum::serve(listener, api::router(state)).await
//! # }
//! ```
//!
//! # Modules
//!
//! - [`catalog`]: the fixed plan list
//! - [`storage`]: storage contract and the in-memory implementation
//! - [`gateway`]: billing provider trait, Stripe client and sandbox
//! - [`lifecycle`]: purchase, lookup, plan change, cancellation
//! - [`proration`]: upgrade and downgrade arithmetic
//! - [`webhook`]: signed provider events
//! - [`api`]: axum router under `/api`
//! - [`security`]: rate limiting and audit logging
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result<T, PortalError>`](error::Result).
//! The api layer maps each variant to one status code; see [`api::ApiError`].

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and axum"
)]

pub mod api;
pub mod catalog;
pub mod checkout;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod models;
pub mod proration;
pub mod security;
pub mod storage;
pub mod webhook;

pub use catalog::PlanCatalog;
pub use config::PortalConfig;
pub use error::{GatewayError, PortalError, Result};
pub use lifecycle::MembershipService;
pub use storage::MemoryStorage;
