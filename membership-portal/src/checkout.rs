//! Checkout form schema and validation.
//!
//! [`PurchaseRequest`] is what the client posts. It carries raw card fields
//! because the form sends them, but they are never copied out: validation
//! produces a [`CheckoutRequest`] without them, and the originals are
//! zeroized when the request is dropped.

use std::fmt;

use rust_decimal::Decimal;
use serde::Deserialize;
use zeroize::Zeroize;

use crate::{
    error::{PortalError, Result},
    models::PlanId,
};

/// Raw `POST /api/payments` body.
///
/// Every field is optional at the schema level so missing values produce a
/// validation message instead of a deserialization error.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    /// Plan to purchase.
    pub plan_id: Option<i64>,
    /// Amount shown to the buyer.
    pub amount: Option<Decimal>,
    /// Name printed on the card.
    pub cardholder_name: Option<String>,
    /// Contact email.
    pub email: Option<String>,
    /// Card number; zeroized on drop.
    pub card_number: Option<String>,
    /// Card expiry; zeroized on drop.
    pub expiry_date: Option<String>,
    /// Card verification code; zeroized on drop.
    pub cvc: Option<String>,
}

impl fmt::Debug for PurchaseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |field: &Option<String>| field.as_ref().map(|_| "<redacted>");
        f.debug_struct("PurchaseRequest")
            .field("plan_id", &self.plan_id)
            .field("amount", &self.amount)
            .field("cardholder_name", &self.cardholder_name)
            .field("email", &self.email)
            .field("card_number", &redacted(&self.card_number))
            .field("expiry_date", &redacted(&self.expiry_date))
            .field("cvc", &redacted(&self.cvc))
            .finish()
    }
}

impl Drop for PurchaseRequest {
    fn drop(&mut self) {
        self.card_number.zeroize();
        self.expiry_date.zeroize();
        self.cvc.zeroize();
    }
}

impl PurchaseRequest {
    /// Checks every field and returns the card-free checkout input.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Validation`] naming the first invalid field.
    pub fn validate(&self) -> Result<CheckoutRequest> {
        let plan_id = match self.plan_id {
            Some(id) if id > 0 => u32::try_from(id)
                .map(PlanId)
                .map_err(|_| PortalError::Validation("planId is out of range".to_owned()))?,
            Some(_) => return Err(PortalError::Validation("planId must be positive".to_owned())),
            None => return Err(PortalError::Validation("planId is required".to_owned())),
        };

        let amount =
            self.amount.ok_or_else(|| PortalError::Validation("amount is required".to_owned()))?;
        validate_amount(amount)?;

        let cardholder_name = self
            .cardholder_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PortalError::Validation("cardholderName is required".to_owned()))?;

        let email = self
            .email
            .as_deref()
            .map(str::trim)
            .ok_or_else(|| PortalError::Validation("email is required".to_owned()))?;
        if !is_valid_email(email) {
            return Err(PortalError::Validation("Invalid email address".to_owned()));
        }

        Ok(CheckoutRequest {
            plan_id,
            amount,
            cardholder_name: cardholder_name.to_owned(),
            email: email.to_owned(),
        })
    }
}

/// Validated checkout input; holds no card data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Plan to purchase.
    pub plan_id: PlanId,
    /// Amount shown to the buyer; positive with at most two decimals.
    pub amount: Decimal,
    /// Name printed on the card, trimmed.
    pub cardholder_name: String,
    /// Contact email, trimmed.
    pub email: String,
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(PortalError::Validation("amount must be positive".to_owned()));
    }
    if amount.normalize().scale() > 2 {
        return Err(PortalError::Validation(
            "amount must have at most two decimal places".to_owned(),
        ));
    }
    Ok(())
}

/// Exactly one `@`, a non-empty local part, and a dotted domain.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.contains(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
