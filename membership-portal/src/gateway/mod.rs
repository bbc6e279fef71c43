//! Billing provider adapter.
//!
//! [`BillingGateway`] is the only way the lifecycle layer reaches the
//! provider. Two implementations ship:
//!
//! - [`StripeGateway`]: the provider's REST API over reqwest
//! - [`SandboxGateway`]: an in-process fake for local runs and tests
//!
//! Gateways never retry. A failure surfaces as [`GatewayError`] with a
//! message that is safe to show the caller.

mod sandbox;
mod stripe;

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::Serialize;

pub use sandbox::{GatewayCall, SandboxGateway};
pub use stripe::{StripeConfig, StripeGateway};

use crate::{error::GatewayError, models::BillingInterval};

/// Provider-side customer handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRef {
    /// Provider customer id.
    pub id: String,
}

/// Parameters for a recurring subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringChargeRequest {
    /// Customer to bill.
    pub customer: CustomerRef,
    /// Product name shown on invoices.
    pub plan_name: String,
    /// Product description.
    pub plan_description: String,
    /// Price per interval in minor units.
    pub amount_minor: i64,
    /// Lowercase ISO currency code.
    pub currency: String,
    /// Billing interval.
    pub interval: BillingInterval,
}

/// A subscription created in incomplete state, awaiting client confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringCharge {
    /// Provider subscription id.
    pub subscription_id: String,
    /// Secret the client uses to confirm the first payment.
    pub client_secret: Option<String>,
    /// Provider subscription status.
    pub status: String,
}

/// Parameters for a single charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneOffChargeRequest {
    /// Amount in minor units; must be positive.
    pub amount_minor: i64,
    /// Lowercase ISO currency code.
    pub currency: String,
    /// Key/value pairs attached to the charge.
    pub metadata: BTreeMap<String, String>,
}

/// A created payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneOffCharge {
    /// Provider payment intent id.
    pub payment_intent_id: String,
    /// Secret the client uses to confirm the payment.
    pub client_secret: Option<String>,
}

/// Operations the membership lifecycle needs from a billing provider.
#[async_trait]
pub trait BillingGateway: Send + Sync + std::fmt::Debug {
    /// Returns the customer registered under `email`, creating one if none exists.
    async fn find_or_create_customer(
        &self,
        email: &str,
        name: &str,
    ) -> Result<CustomerRef, GatewayError>;

    /// Creates a product, a recurring price, and a subscription for it.
    async fn create_recurring_charge(
        &self,
        request: RecurringChargeRequest,
    ) -> Result<RecurringCharge, GatewayError>;

    /// Creates a single payment intent.
    async fn create_one_off_charge(
        &self,
        request: OneOffChargeRequest,
    ) -> Result<OneOffCharge, GatewayError>;

    /// Short label for logs and health reports.
    fn name(&self) -> &'static str;
}

/// Converts a decimal amount to integer minor units.
///
/// Multiplies by 100 and rounds half away from zero, so `9.995` becomes `1000`.
///
/// # Errors
///
/// Returns [`GatewayError`] if the result does not fit in an `i64`.
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|rounded| rounded.to_i64())
        .ok_or_else(|| GatewayError::new(format!("amount {amount} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_minor_units() {
        assert_eq!(to_minor_units(Decimal::new(999, 2)).unwrap(), 999);
        assert_eq!(to_minor_units(Decimal::new(9999, 2)).unwrap(), 9999);
        assert_eq!(to_minor_units(Decimal::new(10, 0)).unwrap(), 1000);
    }

    #[test]
    fn test_to_minor_units_rounds_half_away_from_zero() {
        assert_eq!(to_minor_units(Decimal::new(9995, 3)).unwrap(), 1000);
        assert_eq!(to_minor_units(Decimal::new(9994, 3)).unwrap(), 999);
        assert_eq!(to_minor_units(Decimal::new(-9995, 3)).unwrap(), -1000);
    }

    #[test]
    fn test_to_minor_units_overflow() {
        assert!(to_minor_units(Decimal::MAX).is_err());
    }
}
