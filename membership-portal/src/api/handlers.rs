//! Route handlers.
//!
//! Handlers parse path and body input, call [`MembershipService`], and shape
//! the JSON response. Every error leaves through [`ApiError`].
//!
//! [`MembershipService`]: crate::lifecycle::MembershipService

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::HeaderMap,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::{
    audit,
    checkout::PurchaseRequest,
    error::PortalError,
    gateway::RecurringCharge,
    lifecycle::MembershipLookup,
    models::{MembershipId, MembershipPlan, Payment, PaymentId, PaymentSummary, PlanId, UserMembership},
    security::AuditEventType,
};

/// Header carrying the provider's webhook signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `POST /payments` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    /// Always `true`.
    pub success: bool,
    /// Recorded payment.
    pub payment: Payment,
    /// Purchased plan.
    pub plan: MembershipPlan,
    /// New membership.
    pub membership: UserMembership,
    /// Provider subscription the client confirms.
    pub subscription: RecurringCharge,
}

/// `POST /membership/{membershipId}/change-plan` body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    /// Target plan.
    pub new_plan_id: Option<i64>,
}

/// `POST /membership/{membershipId}/change-plan` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanResponse {
    /// Always `true`.
    pub success: bool,
    /// Updated membership.
    pub membership: UserMembership,
    /// New plan.
    pub plan: MembershipPlan,
    /// Prorated amount; zero for downgrades.
    pub prorated_amount: Decimal,
    /// Set when a prorated charge was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    /// Set when a prorated charge was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// `POST /membership/{membershipId}/cancel` response.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// Always `true`.
    pub success: bool,
    /// The cancelled membership.
    pub membership: UserMembership,
}

/// `GET /membership-plans`
///
/// # Errors
///
/// 500 if storage fails.
#[instrument(skip(state))]
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Vec<MembershipPlan>> {
    Ok(Json(state.service.list_plans().await?))
}

/// `GET /membership-plans/{id}`
///
/// # Errors
///
/// 400 for a non-numeric or non-positive id, 404 for an unknown plan.
#[instrument(skip(state))]
pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MembershipPlan> {
    let id = parse_id::<u32>(&id, "plan").map(PlanId)?;
    Ok(Json(state.service.get_plan(id).await?))
}

/// `POST /payments`
///
/// # Errors
///
/// 429 when rate limited, 400 for invalid input or a provider rejection,
/// 404 for an unknown plan.
#[instrument(skip(state, payload))]
pub async fn create_payment(
    State(state): State<AppState>,
    payload: Result<Json<PurchaseRequest>, JsonRejection>,
) -> ApiResult<PurchaseResponse> {
    throttle(&state, "/payments").await?;

    let Json(request) = payload?;
    let checkout = request.validate()?;
    drop(request);

    let outcome = state.service.purchase(checkout).await?;
    Ok(Json(PurchaseResponse {
        success: true,
        payment: outcome.payment,
        plan: outcome.plan,
        membership: outcome.membership,
        subscription: outcome.subscription,
    }))
}

/// `GET /payments/{id}`
///
/// Returns only the client-safe [`PaymentSummary`] fields.
///
/// # Errors
///
/// 400 for an invalid id, 404 for an unknown payment.
#[instrument(skip(state))]
pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<PaymentSummary> {
    let id = parse_id::<u64>(&id, "payment").map(PaymentId)?;
    let payment = state.service.get_payment(id).await?;
    Ok(Json(PaymentSummary::from(&payment)))
}

/// `GET /membership/{email}`
///
/// # Errors
///
/// 404 when the email has no active membership.
#[instrument(skip(state, email))]
pub async fn get_membership(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<MembershipLookup> {
    Ok(Json(state.service.lookup_by_email(email.trim()).await?))
}

/// `POST /membership/{membershipId}/change-plan`
///
/// # Errors
///
/// 429 when rate limited, 400 for invalid input, an inactive membership or
/// a provider rejection, 404 for an unknown membership or plan.
#[instrument(skip(state, payload))]
pub async fn change_plan(
    State(state): State<AppState>,
    Path(membership_id): Path<String>,
    payload: Result<Json<ChangePlanRequest>, JsonRejection>,
) -> ApiResult<ChangePlanResponse> {
    throttle(&state, "/membership/change-plan").await?;

    let membership_id = parse_id::<u64>(&membership_id, "membership").map(MembershipId)?;
    let Json(body) = payload?;
    let new_plan_id = match body.new_plan_id {
        Some(id) if id > 0 => u32::try_from(id)
            .map(PlanId)
            .map_err(|_| PortalError::Validation("newPlanId is out of range".to_owned()))?,
        Some(_) => return Err(PortalError::Validation("newPlanId must be positive".to_owned()).into()),
        None => return Err(PortalError::Validation("newPlanId is required".to_owned()).into()),
    };

    let outcome = state.service.change_plan(membership_id, new_plan_id).await?;
    let (payment_intent_id, client_secret) = match outcome.charge {
        Some(charge) => (Some(charge.payment_intent_id), charge.client_secret),
        None => (None, None),
    };

    Ok(Json(ChangePlanResponse {
        success: true,
        membership: outcome.membership,
        plan: outcome.plan,
        prorated_amount: outcome.prorated_amount,
        payment_intent_id,
        client_secret,
    }))
}

/// `POST /membership/{membershipId}/cancel`
///
/// # Errors
///
/// 400 for an invalid id or an already cancelled membership, 404 for an
/// unknown membership.
#[instrument(skip(state))]
pub async fn cancel_membership(
    State(state): State<AppState>,
    Path(membership_id): Path<String>,
) -> ApiResult<CancelResponse> {
    let membership_id = parse_id::<u64>(&membership_id, "membership").map(MembershipId)?;
    let membership = state.service.cancel(membership_id).await?;
    Ok(Json(CancelResponse { success: true, membership }))
}

/// `POST /webhook`
///
/// Reads the raw body so the signature is checked over the exact bytes the
/// provider sent.
///
/// # Errors
///
/// 400 for a missing or mismatched signature or a malformed event, 500 if
/// no webhook secret is configured.
#[instrument(skip(state, headers, body), fields(len = body.len()))]
pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Value> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok());
    let outcome = state.webhooks.handle(&body, signature).await?;
    debug!(?outcome, "webhook handled");
    Ok(Json(json!({ "received": true })))
}

async fn throttle(state: &AppState, route: &str) -> Result<(), ApiError> {
    if let Err(err) = state.limiter.acquire().await {
        audit!(AuditEventType::RateLimitExceeded, Uuid::new_v4(), with_error(route));
        return Err(err.into());
    }
    Ok(())
}

fn parse_id<T>(raw: &str, what: &str) -> Result<T, PortalError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.trim()
        .parse::<T>()
        .ok()
        .filter(|id| *id > T::default())
        .ok_or_else(|| PortalError::Validation(format!("Invalid {what} ID")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id::<u32>("7", "plan").unwrap(), 7);
        assert_eq!(parse_id::<u64>(" 12 ", "payment").unwrap(), 12);
        assert!(parse_id::<u32>("0", "plan").is_err());
        assert!(parse_id::<u32>("-1", "plan").is_err());
        assert!(parse_id::<u32>("abc", "plan").is_err());
        assert_eq!(parse_id::<u32>("x", "plan").unwrap_err().to_string(), "Invalid plan ID");
    }

    #[test]
    fn test_change_plan_response_omits_missing_charge() {
        let json = serde_json::to_value(ChangePlanResponse {
            success: true,
            membership: UserMembership {
                id: MembershipId(1),
                user_id: crate::models::UserId(1),
                plan_id: PlanId(2),
                status: crate::models::MembershipStatus::Active,
                start_date: chrono::Utc::now(),
                end_date: chrono::Utc::now(),
                created_at: chrono::Utc::now(),
                stripe_subscription_id: None,
            },
            plan: crate::PlanCatalog::seeded().list_plans()[1].clone(),
            prorated_amount: Decimal::ZERO,
            payment_intent_id: None,
            client_secret: None,
        })
        .unwrap();

        assert_eq!(json["proratedAmount"], "0");
        assert!(json.get("paymentIntentId").is_none());
        assert!(json.get("clientSecret").is_none());
    }
}
