//! Abuse controls and audit trail.
//!
//! [`RateLimiter`] guards the mutating API routes with a token bucket;
//! [`audit`] records purchases, plan changes, cancellations, and webhook
//! outcomes on a dedicated tracing target with emails masked and card data
//! scrubbed:
//!
//! ```rust
//! use membership_portal::{audit, security::audit::AuditEventType};
//! use uuid::Uuid;
//!
//! audit!(
//!     AuditEventType::PurchaseSucceeded,
//!     Uuid::new_v4(),
//!     with_email("member@example.com"),
//!     with_plan_id(1)
//! );
//! ```

pub mod audit;
mod rate_limit;

pub use audit::{AuditDetails, AuditEvent, AuditEventType, audit_log, redact_email, redact_sensitive};
pub use rate_limit::{RateLimitConfig, RateLimiter};
