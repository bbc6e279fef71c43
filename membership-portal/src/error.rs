//! Error types for the membership portal.
//!
//! All errors implement [`std::error::Error`] via [`thiserror::Error`].
//!
//! # Error Categories
//!
//! - **Validation errors** ([`PortalError::Validation`]): malformed or missing input
//! - **Lookup errors** ([`PortalError::PlanNotFound`], [`PortalError::NotFound`]):
//!   unresolvable ids or emails
//! - **Gateway errors** ([`PortalError::Gateway`]): the billing provider rejected a call
//! - **Internal errors** ([`PortalError::Internal`], [`PortalError::Config`]): anything
//!   unexpected; the detail is logged, never returned to clients
//!
//! # Examples
//!
//! ```
//! use membership_portal::error::{PortalError, Result};
//!
//! fn require_name(name: &str) -> Result<&str> {
//!     if name.trim().is_empty() {
//!         return Err(PortalError::Validation("cardholderName is required".to_owned()));
//!     }
//!     Ok(name)
//! }
//!
//! assert!(require_name("").is_err());
//! ```

use thiserror::Error;

use crate::models::PlanId;

/// Result type alias for portal operations.
pub type Result<T, E = PortalError> = std::result::Result<T, E>;

/// Failure reported by the billing provider or by the transport to it.
///
/// The message is passed through to clients unchanged, so implementations
/// must never put secret keys or card data into it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GatewayError {
    /// Human-readable reason, usually the provider's own error message.
    pub message: String,
}

impl GatewayError {
    /// Creates a gateway error from any displayable message.
    #[must_use]
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self { message: message.into() }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::new("billing provider timed out");
        }
        // reqwest errors can embed the request URL; keep only the kind.
        Self::new(format!("billing provider unreachable: {}", err.without_url()))
    }
}

/// Errors that can occur in the membership portal.
///
/// # Error Recovery
///
/// - **Validation errors**: fix the request and retry
/// - **Not found errors**: the id or email does not resolve; do not retry
/// - **Gateway errors**: the charge was not created (or timed out); the caller
///   decides whether to retry, the portal never does
/// - **Internal errors**: report to operators; the response carries a generic message
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum PortalError {
    /// Request input failed validation.
    #[error("{0}")]
    Validation(String),

    /// The referenced membership plan does not exist.
    #[error("Membership plan {0} not found")]
    PlanNotFound(PlanId),

    /// A membership, payment, or email lookup did not resolve.
    #[error("{0}")]
    NotFound(String),

    /// The billing provider rejected the call.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Webhook payload signature was missing, malformed, stale, or wrong.
    #[error("Webhook signature verification failed: {0}")]
    WebhookSignature(String),

    /// Too many requests in the current window.
    #[error("Too many requests, please try again later")]
    RateLimitExceeded,

    /// Configuration could not be loaded or is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Unexpected failure; the detail is for logs only.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortalError {
    /// Returns `true` for errors whose detail must not reach clients.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Internal(_))
    }
}
