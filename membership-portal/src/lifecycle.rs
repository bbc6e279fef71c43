//! Membership lifecycle: purchase, lookup, plan change, cancellation.
//!
//! A membership moves `none -> active` on purchase, stays `active` across
//! plan changes, and ends in `cancelled`, which is terminal. Mutations of one
//! membership are serialized by a per-id async mutex; every gateway call is
//! bounded by a timeout.
//!
//! Purchase is not transactional. If storage fails after the provider
//! created the subscription, the subscription is left in place.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    audit,
    checkout::CheckoutRequest,
    error::{GatewayError, PortalError, Result},
    gateway::{
        BillingGateway, OneOffCharge, OneOffChargeRequest, RecurringCharge,
        RecurringChargeRequest, to_minor_units,
    },
    models::{
        MembershipId, MembershipPlan, MembershipStatus, MembershipUpdate, NewPayment, NewUser,
        NewUserMembership, Payment, PaymentId, PaymentStatus, PlanId, User, UserMembership,
    },
    proration::{self, PlanChangeKind},
    security::audit::AuditEventType,
    storage::Storage,
};

/// Default bound on a single gateway call.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a successful purchase produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOutcome {
    /// Recorded payment, status `active`.
    pub payment: Payment,
    /// New membership, status `active`.
    pub membership: UserMembership,
    /// Purchased plan.
    pub plan: MembershipPlan,
    /// Provider subscription awaiting client confirmation.
    pub subscription: RecurringCharge,
}

/// An active membership and its plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipLookup {
    /// The membership.
    pub membership: UserMembership,
    /// Its current plan.
    pub plan: MembershipPlan,
}

/// Result of a plan change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChangeOutcome {
    /// Updated membership.
    pub membership: UserMembership,
    /// New plan.
    pub plan: MembershipPlan,
    /// Direction of the change by total price.
    pub kind: PlanChangeKind,
    /// Days that were left on the old window, clamped at zero.
    pub days_remaining: i64,
    /// Prorated amount in currency units; may be negative for an upgrade
    /// to a plan with a lower daily rate, in which case nothing is charged.
    pub prorated_amount: Decimal,
    /// The one-off charge, when one was issued.
    pub charge: Option<OneOffCharge>,
}

/// Coordinates storage and the billing gateway.
pub struct MembershipService {
    storage: Arc<dyn Storage>,
    gateway: Arc<dyn BillingGateway>,
    currency: String,
    gateway_timeout: Duration,
    locks: Mutex<HashMap<MembershipId, Arc<tokio::sync::Mutex<()>>>>,
}

impl fmt::Debug for MembershipService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipService")
            .field("gateway", &self.gateway)
            .field("currency", &self.currency)
            .field("gateway_timeout", &self.gateway_timeout)
            .finish_non_exhaustive()
    }
}

impl MembershipService {
    /// Creates a service billing in USD with [`DEFAULT_GATEWAY_TIMEOUT`].
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, gateway: Arc<dyn BillingGateway>) -> Self {
        Self {
            storage,
            gateway,
            currency: "usd".to_owned(),
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the ISO currency code used for every charge.
    #[must_use]
    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_ascii_lowercase();
        self
    }

    /// Sets the bound on each gateway call.
    #[must_use]
    pub const fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    /// Name of the configured gateway.
    #[must_use]
    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    /// All plans in catalog order.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn list_plans(&self) -> Result<Vec<MembershipPlan>> {
        self.storage.get_membership_plans().await
    }

    /// One plan by id.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::PlanNotFound`] for an unknown id.
    pub async fn get_plan(&self, id: PlanId) -> Result<MembershipPlan> {
        self.storage.get_membership_plan(id).await?.ok_or(PortalError::PlanNotFound(id))
    }

    /// One payment by id.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::NotFound`] for an unknown id.
    pub async fn get_payment(&self, id: PaymentId) -> Result<Payment> {
        self.storage
            .get_payment(id)
            .await?
            .ok_or_else(|| PortalError::NotFound("Payment not found".to_owned()))
    }

    /// Buys `request.plan_id` for the member in `request`.
    ///
    /// Creates (or reuses) a provider customer, starts a recurring charge at
    /// the plan's price, then records an `active` payment and an `active`
    /// membership. The submitted amount is recorded on the payment but the
    /// provider is always charged the catalog price.
    ///
    /// # Errors
    ///
    /// - [`PortalError::PlanNotFound`] before anything is written or charged
    /// - [`PortalError::Gateway`] when the provider rejects or times out;
    ///   nothing is written
    pub async fn purchase(&self, request: CheckoutRequest) -> Result<PurchaseOutcome> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self.purchase_inner(&request).await;

        match &result {
            Ok(outcome) => audit!(
                AuditEventType::PurchaseSucceeded,
                request_id,
                with_email(&request.email),
                with_plan_id(outcome.plan.id.get()),
                with_payment_id(outcome.payment.id.get()),
                with_membership_id(outcome.membership.id.get()),
                with_amount(outcome.plan.price),
                with_duration(started.elapsed()),
            ),
            Err(err) => audit!(
                AuditEventType::PurchaseFailed,
                request_id,
                with_email(&request.email),
                with_plan_id(request.plan_id.get()),
                with_error(&err.to_string()),
                with_duration(started.elapsed()),
            ),
        }
        result
    }

    #[instrument(skip(self, request), fields(plan_id = %request.plan_id))]
    async fn purchase_inner(&self, request: &CheckoutRequest) -> Result<PurchaseOutcome> {
        let plan = self.get_plan(request.plan_id).await?;
        let end_date = proration::end_date_for(&plan, Utc::now())?;
        if request.amount != plan.price {
            warn!(submitted = %request.amount, price = %plan.price, "submitted amount differs from plan price");
        }

        let customer = self
            .call(self.gateway.find_or_create_customer(&request.email, &request.cardholder_name))
            .await?;
        let subscription = self
            .call(self.gateway.create_recurring_charge(RecurringChargeRequest {
                customer: customer.clone(),
                plan_name: plan.name.clone(),
                plan_description: format!("{} ({} days)", plan.name, plan.validity_days),
                amount_minor: to_minor_units(plan.price)?,
                currency: self.currency.clone(),
                interval: plan.plan_type.billing_interval(),
            }))
            .await?;
        debug!(subscription_id = %subscription.subscription_id, "subscription created");

        let payment = self
            .storage
            .create_payment(NewPayment {
                plan_id: plan.id,
                amount: request.amount,
                cardholder_name: request.cardholder_name.clone(),
                email: request.email.clone(),
                status: Some(PaymentStatus::Active),
                stripe_subscription_id: Some(subscription.subscription_id.clone()),
                stripe_customer_id: Some(customer.id),
            })
            .await?;

        let user = self.find_or_create_user(&request.email).await?;
        let membership = self
            .storage
            .create_user_membership(NewUserMembership {
                user_id: user.id,
                plan_id: plan.id,
                status: MembershipStatus::Active,
                end_date,
                stripe_subscription_id: Some(subscription.subscription_id.clone()),
            })
            .await?;

        info!(
            payment_id = %payment.id,
            membership_id = %membership.id,
            "membership purchased"
        );
        Ok(PurchaseOutcome { payment, membership, plan, subscription })
    }

    async fn find_or_create_user(&self, email: &str) -> Result<User> {
        if let Some(user) = self.storage.get_user_by_username(email).await? {
            return Ok(user);
        }
        self.storage.create_user(NewUser { username: email.to_owned() }).await
    }

    /// Resolves an email to an active membership and its plan.
    ///
    /// Goes through the payment email, so on a shared plan it can return
    /// another member's membership.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::NotFound`] when nothing matches.
    #[instrument(skip(self, email))]
    pub async fn lookup_by_email(&self, email: &str) -> Result<MembershipLookup> {
        let membership = self.storage.get_user_membership_by_email(email).await?.ok_or_else(|| {
            PortalError::NotFound("No active membership found for this email".to_owned())
        })?;
        let plan = self.get_plan(membership.plan_id).await?;
        Ok(MembershipLookup { membership, plan })
    }

    /// Moves a membership to `new_plan_id`, charging the prorated difference
    /// for an upgrade.
    ///
    /// The new validity window starts now. If a charge is issued, its payment
    /// intent id replaces the membership's provider id.
    ///
    /// # Errors
    ///
    /// - [`PortalError::NotFound`] for an unknown membership
    /// - [`PortalError::Validation`] if the membership is cancelled
    /// - [`PortalError::PlanNotFound`] if either plan is unknown
    /// - [`PortalError::Gateway`] if the charge fails; nothing is updated
    pub async fn change_plan(
        &self,
        membership_id: MembershipId,
        new_plan_id: PlanId,
    ) -> Result<PlanChangeOutcome> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self.change_plan_inner(membership_id, new_plan_id).await;

        match &result {
            Ok(outcome) => audit!(
                AuditEventType::PlanChanged,
                request_id,
                with_membership_id(membership_id.get()),
                with_plan_id(new_plan_id.get()),
                with_amount(outcome.prorated_amount),
                with_duration(started.elapsed()),
            ),
            Err(err) => audit!(
                AuditEventType::PlanChangeFailed,
                request_id,
                with_membership_id(membership_id.get()),
                with_plan_id(new_plan_id.get()),
                with_error(&err.to_string()),
            ),
        }
        result
    }

    #[instrument(skip(self), fields(membership_id = %membership_id, new_plan_id = %new_plan_id))]
    async fn change_plan_inner(
        &self,
        membership_id: MembershipId,
        new_plan_id: PlanId,
    ) -> Result<PlanChangeOutcome> {
        let lock = self.membership_lock(membership_id);
        let _guard = lock.lock().await;

        let membership = self.load_membership(membership_id).await?;
        if !membership.is_active() {
            return Err(PortalError::Validation("Membership is not active".to_owned()));
        }

        let current_plan = self.get_plan(membership.plan_id).await?;
        let new_plan = self.get_plan(new_plan_id).await?;

        let now = Utc::now();
        let quote = proration::quote(&current_plan, &new_plan, membership.end_date, now);
        let end_date = proration::end_date_for(&new_plan, now)?;
        debug!(kind = ?quote.kind, days = quote.days_remaining, amount = %quote.amount, "plan change quoted");

        let charge = if quote.requires_charge() {
            let metadata = BTreeMap::from([
                ("membership_id".to_owned(), membership_id.to_string()),
                ("from_plan_id".to_owned(), current_plan.id.to_string()),
                ("to_plan_id".to_owned(), new_plan.id.to_string()),
                ("type".to_owned(), "proration".to_owned()),
            ]);
            let charge = self
                .call(self.gateway.create_one_off_charge(OneOffChargeRequest {
                    amount_minor: to_minor_units(quote.amount)?,
                    currency: self.currency.clone(),
                    metadata,
                }))
                .await?;
            Some(charge)
        } else {
            None
        };

        let membership = self
            .storage
            .update_user_membership(membership_id, MembershipUpdate {
                plan_id: Some(new_plan.id),
                end_date: Some(end_date),
                stripe_subscription_id: charge.as_ref().map(|c| c.payment_intent_id.clone()),
                ..MembershipUpdate::default()
            })
            .await?;

        info!(kind = ?quote.kind, amount = %quote.amount, "plan changed");
        Ok(PlanChangeOutcome {
            membership,
            plan: new_plan,
            kind: quote.kind,
            days_remaining: quote.days_remaining,
            prorated_amount: quote.amount,
            charge,
        })
    }

    /// Cancels an active membership.
    ///
    /// # Errors
    ///
    /// - [`PortalError::NotFound`] for an unknown membership
    /// - [`PortalError::Validation`] if it is already cancelled
    #[instrument(skip(self), fields(membership_id = %membership_id))]
    pub async fn cancel(&self, membership_id: MembershipId) -> Result<UserMembership> {
        let lock = self.membership_lock(membership_id);
        let _guard = lock.lock().await;

        let membership = self.load_membership(membership_id).await?;
        if !membership.is_active() {
            return Err(PortalError::Validation("Membership is already cancelled".to_owned()));
        }

        let membership = self.mark_cancelled(membership_id).await?;
        audit!(
            AuditEventType::MembershipCancelled,
            Uuid::new_v4(),
            with_membership_id(membership_id.get()),
        );
        Ok(membership)
    }

    /// Applies a provider-side subscription deletion.
    ///
    /// Cancels the membership and the payment carrying `subscription_id`.
    /// Unknown ids and already-cancelled memberships are a no-op.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    #[instrument(skip(self))]
    pub async fn end_subscription(&self, subscription_id: &str) -> Result<Option<UserMembership>> {
        if let Some(payment) = self.storage.find_payment_by_subscription(subscription_id).await? {
            self.storage.update_payment_status(payment.id, PaymentStatus::Cancelled).await?;
        }

        let Some(found) = self.storage.find_membership_by_subscription(subscription_id).await?
        else {
            debug!("no membership for subscription");
            return Ok(None);
        };

        let lock = self.membership_lock(found.id);
        let _guard = lock.lock().await;
        let membership = self.load_membership(found.id).await?;
        if !membership.is_active() {
            return Ok(Some(membership));
        }

        let membership = self.mark_cancelled(found.id).await?;
        audit!(
            AuditEventType::MembershipCancelled,
            Uuid::new_v4(),
            with_membership_id(membership.id.get()),
            with_provider_event(subscription_id),
        );
        Ok(Some(membership))
    }

    /// Sets the status of the payment carrying `subscription_id`.
    ///
    /// Returns `None` when no payment carries that id.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    #[instrument(skip(self))]
    pub async fn record_invoice_outcome(
        &self,
        subscription_id: &str,
        status: PaymentStatus,
    ) -> Result<Option<Payment>> {
        let Some(payment) = self.storage.find_payment_by_subscription(subscription_id).await?
        else {
            debug!("no payment for subscription");
            return Ok(None);
        };
        let payment = self.storage.update_payment_status(payment.id, status).await?;
        info!(payment_id = %payment.id, ?status, "payment status updated");
        Ok(Some(payment))
    }

    async fn load_membership(&self, id: MembershipId) -> Result<UserMembership> {
        self.storage
            .get_user_membership_by_id(id)
            .await?
            .ok_or_else(|| PortalError::NotFound("Membership not found".to_owned()))
    }

    async fn mark_cancelled(&self, id: MembershipId) -> Result<UserMembership> {
        self.storage
            .update_user_membership(id, MembershipUpdate {
                status: Some(MembershipStatus::Cancelled),
                ..MembershipUpdate::default()
            })
            .await
    }

    fn membership_lock(&self, id: MembershipId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    async fn call<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, GatewayError>>,
    {
        match tokio::time::timeout(self.gateway_timeout, call).await {
            Ok(result) => result.map_err(PortalError::from),
            Err(_) => {
                warn!(timeout = ?self.gateway_timeout, gateway = self.gateway.name(), "gateway call timed out");
                Err(GatewayError::new("billing provider timed out").into())
            }
        }
    }
}
