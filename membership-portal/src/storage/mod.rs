//! Storage contract over users, plans, payments, and memberships.
//!
//! Each capability is its own trait so a backend can be assembled piecewise;
//! [`Storage`] is the union the lifecycle service depends on. Lookups return
//! `Ok(None)` for "not found"; only updates of a missing id are errors.
//!
//! The only shipped backend is [`MemoryStorage`].

mod memory;

use async_trait::async_trait;

pub use memory::MemoryStorage;

use crate::{
    error::Result,
    models::{
        MembershipId, MembershipPlan, MembershipUpdate, NewPayment, NewUser, NewUserMembership,
        Payment, PaymentId, PaymentStatus, PlanId, User, UserId, UserMembership,
    },
};

/// User records.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Stores a user under the next id.
    ///
    /// No uniqueness check is made on `username`.
    async fn create_user(&self, user: NewUser) -> Result<User>;

    /// Looks a user up by id.
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    /// Looks a user up by exact username.
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
}

/// Read-only plan catalog access.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Returns all plans in catalog order.
    async fn get_membership_plans(&self) -> Result<Vec<MembershipPlan>>;

    /// Looks a plan up by id.
    async fn get_membership_plan(&self, id: PlanId) -> Result<Option<MembershipPlan>>;
}

/// Payment records.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Stores a payment under the next id.
    ///
    /// Sets `user_id` to `None`, defaults the status to
    /// [`PaymentStatus::Pending`], and stamps `created_at`.
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment>;

    /// Looks a payment up by id.
    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>>;

    /// Moves a payment to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PortalError::NotFound`] if `id` does not exist.
    async fn update_payment_status(&self, id: PaymentId, status: PaymentStatus)
    -> Result<Payment>;

    /// Returns the first payment carrying the provider subscription id.
    async fn find_payment_by_subscription(&self, subscription_id: &str)
    -> Result<Option<Payment>>;
}

/// Membership records.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Stores a membership under the next id, stamping `start_date` and `created_at`.
    async fn create_user_membership(&self, membership: NewUserMembership)
    -> Result<UserMembership>;

    /// Returns the first *active* membership of `user_id`.
    ///
    /// Nothing prevents a user from holding several active memberships; when
    /// that happens the lowest id wins.
    async fn get_user_membership(&self, user_id: UserId) -> Result<Option<UserMembership>>;

    /// Looks a membership up by id regardless of status.
    async fn get_user_membership_by_id(&self, id: MembershipId)
    -> Result<Option<UserMembership>>;

    /// Merges `update` into the stored membership and returns the result.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PortalError::NotFound`] if `id` does not exist.
    async fn update_user_membership(
        &self,
        id: MembershipId,
        update: MembershipUpdate,
    ) -> Result<UserMembership>;

    /// Resolves an email to an active membership.
    ///
    /// Heuristic join: the first payment whose email matches, then the first
    /// active membership on that payment's plan. A different member's active
    /// membership on the same plan can match.
    async fn get_user_membership_by_email(&self, email: &str) -> Result<Option<UserMembership>>;

    /// Returns the first membership carrying the provider subscription id.
    async fn find_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserMembership>>;
}

/// Every storage capability the lifecycle service needs.
pub trait Storage: UserStore + PlanStore + PaymentStore + MembershipStore {}

impl<T> Storage for T where T: UserStore + PlanStore + PaymentStore + MembershipStore {}
