//! Entity types shared by storage, the lifecycle service, and the HTTP layer.
//!
//! Ids are integer newtypes assigned by storage. Money is [`Decimal`], which
//! serializes as a JSON string (`"9.99"`) so amounts never pass through
//! floating point. Field names are camelCase on the wire.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Returns the raw integer value.
            #[must_use]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

integer_id!(
    /// Identifier of a [`User`].
    UserId(u64)
);
integer_id!(
    /// Identifier of a [`MembershipPlan`].
    PlanId(u32)
);
integer_id!(
    /// Identifier of a [`Payment`].
    PaymentId(u64)
);
integer_id!(
    /// Identifier of a [`UserMembership`].
    MembershipId(u64)
);

/// Billing period of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// Billed every month.
    Monthly,
    /// Billed every year.
    Annual,
}

impl PlanType {
    /// Returns the provider's recurring interval for this plan type.
    #[must_use]
    pub const fn billing_interval(self) -> BillingInterval {
        match self {
            Self::Monthly => BillingInterval::Month,
            Self::Annual => BillingInterval::Year,
        }
    }
}

/// Recurring interval understood by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Monthly recurrence.
    Month,
    /// Yearly recurrence.
    Year,
}

impl BillingInterval {
    /// Returns the provider's wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// Immutable catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipPlan {
    /// Unique id assigned at seed time.
    pub id: PlanId,
    /// Display name.
    pub name: String,
    /// Billing period.
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    /// Total price for one validity period.
    pub price: Decimal,
    /// Length of one validity period in days.
    pub validity_days: u32,
    /// Ordered feature list.
    pub features: Vec<String>,
}

impl MembershipPlan {
    /// Returns the price spread over one day of validity.
    #[must_use]
    pub fn daily_rate(&self) -> Decimal {
        if self.validity_days == 0 {
            return Decimal::ZERO;
        }
        self.price / Decimal::from(self.validity_days)
    }
}

/// Registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique id.
    pub id: UserId,
    /// Login name; the checkout flow uses the member's email.
    pub username: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Input for [`crate::storage::UserStore::create_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    /// Login name.
    pub username: String,
}

/// Lifecycle state of a payment record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Created but not yet confirmed.
    #[default]
    Pending,
    /// Subscription created at checkout.
    Active,
    /// Provider confirmed the invoice was paid.
    Completed,
    /// Subscription ended at the provider.
    Cancelled,
    /// Provider reported a failed charge.
    Failed,
}

/// Record of a billing attempt.
///
/// Card data never reaches this type; see [`crate::checkout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// Unique id.
    pub id: PaymentId,
    /// Owning user; always `None` when created by the checkout flow.
    pub user_id: Option<UserId>,
    /// Purchased plan.
    pub plan_id: PlanId,
    /// Amount submitted at checkout.
    pub amount: Decimal,
    /// Name printed on the card.
    pub cardholder_name: String,
    /// Contact email.
    pub email: String,
    /// Current status.
    pub status: PaymentStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Provider subscription id, when one was created.
    pub stripe_subscription_id: Option<String>,
    /// Provider customer id, when one was created.
    pub stripe_customer_id: Option<String>,
}

/// Input for [`crate::storage::PaymentStore::create_payment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    /// Purchased plan.
    pub plan_id: PlanId,
    /// Amount submitted at checkout.
    pub amount: Decimal,
    /// Name printed on the card.
    pub cardholder_name: String,
    /// Contact email.
    pub email: String,
    /// Initial status; storage defaults to [`PaymentStatus::Pending`].
    pub status: Option<PaymentStatus>,
    /// Provider subscription id.
    pub stripe_subscription_id: Option<String>,
    /// Provider customer id.
    pub stripe_customer_id: Option<String>,
}

/// Client-safe projection of a [`Payment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    /// Unique id.
    pub id: PaymentId,
    /// Purchased plan.
    pub plan_id: PlanId,
    /// Amount submitted at checkout.
    pub amount: Decimal,
    /// Current status.
    pub status: PaymentStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<&Payment> for PaymentSummary {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            plan_id: payment.plan_id,
            amount: payment.amount,
            status: payment.status,
            created_at: payment.created_at,
        }
    }
}

/// Lifecycle state of a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// Entitlement is in force.
    Active,
    /// Entitlement ended; terminal.
    Cancelled,
}

/// A member's current entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMembership {
    /// Unique id.
    pub id: MembershipId,
    /// Owning user.
    pub user_id: UserId,
    /// Current plan; changes on upgrade or downgrade.
    pub plan_id: PlanId,
    /// Current status.
    pub status: MembershipStatus,
    /// Set at creation, never reset.
    pub start_date: DateTime<Utc>,
    /// Recomputed on every plan change.
    pub end_date: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Provider id of the latest subscription or proration charge.
    pub stripe_subscription_id: Option<String>,
}

impl UserMembership {
    /// Returns `true` while the membership is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}

/// Input for [`crate::storage::MembershipStore::create_user_membership`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserMembership {
    /// Owning user.
    pub user_id: UserId,
    /// Purchased plan.
    pub plan_id: PlanId,
    /// Initial status.
    pub status: MembershipStatus,
    /// End of the first validity window.
    pub end_date: DateTime<Utc>,
    /// Provider subscription id.
    pub stripe_subscription_id: Option<String>,
}

/// Partial update merged by [`crate::storage::MembershipStore::update_user_membership`].
///
/// `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipUpdate {
    /// New plan.
    pub plan_id: Option<PlanId>,
    /// New status.
    pub status: Option<MembershipStatus>,
    /// New end date.
    pub end_date: Option<DateTime<Utc>>,
    /// New provider id.
    pub stripe_subscription_id: Option<String>,
}

impl MembershipUpdate {
    /// Applies the set fields to `membership`.
    pub fn apply_to(self, membership: &mut UserMembership) {
        if let Some(plan_id) = self.plan_id {
            membership.plan_id = plan_id;
        }
        if let Some(status) = self.status {
            membership.status = status;
        }
        if let Some(end_date) = self.end_date {
            membership.end_date = end_date;
        }
        if let Some(subscription_id) = self.stripe_subscription_id {
            membership.stripe_subscription_id = Some(subscription_id);
        }
    }
}
