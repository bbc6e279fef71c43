//! In-memory storage backend.
//!
//! Tables are `BTreeMap`s keyed by integer id behind a single
//! `tokio::sync::RwLock`, so iteration is in id order (which is insertion
//! order) and every operation is atomic on its own. Counters start at 1 and
//! are never rewound. Data is lost when the last handle is dropped.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::{MembershipStore, PaymentStore, PlanStore, UserStore};
use crate::{
    catalog::PlanCatalog,
    error::{PortalError, Result},
    models::{
        MembershipId, MembershipPlan, MembershipUpdate, NewPayment, NewUser, NewUserMembership,
        Payment, PaymentId, PaymentStatus, PlanId, User, UserId, UserMembership,
    },
};

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<u64, User>,
    payments: BTreeMap<u64, Payment>,
    memberships: BTreeMap<u64, UserMembership>,
    next_user_id: u64,
    next_payment_id: u64,
    next_membership_id: u64,
}

impl Tables {
    fn new() -> Self {
        Self { next_user_id: 1, next_payment_id: 1, next_membership_id: 1, ..Self::default() }
    }

    fn allocate(counter: &mut u64) -> u64 {
        let id = *counter;
        *counter += 1;
        id
    }
}

/// Process-local store; cheap to clone, clones share data.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    catalog: Arc<PlanCatalog>,
    tables: Arc<RwLock<Tables>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(PlanCatalog::seeded())
    }
}

impl MemoryStorage {
    /// Creates an empty store serving `catalog`.
    #[must_use]
    pub fn new(catalog: PlanCatalog) -> Self {
        Self { catalog: Arc::new(catalog), tables: Arc::new(RwLock::new(Tables::new())) }
    }

    /// Number of stored payments.
    pub async fn payment_count(&self) -> usize {
        self.tables.read().await.payments.len()
    }

    /// Number of stored memberships.
    pub async fn membership_count(&self) -> usize {
        self.tables.read().await.memberships.len()
    }
}

#[async_trait]
impl UserStore for MemoryStorage {
    #[instrument(skip(self, user), level = "debug")]
    async fn create_user(&self, user: NewUser) -> Result<User> {
        let mut tables = self.tables.write().await;
        let id = Tables::allocate(&mut tables.next_user_id);
        let user = User { id: UserId(id), username: user.username, created_at: Utc::now() };
        tables.users.insert(id, user.clone());
        debug!(user_id = id, "user created");
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.tables.read().await.users.get(&id.get()).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|user| user.username == username).cloned())
    }
}

#[async_trait]
impl PlanStore for MemoryStorage {
    async fn get_membership_plans(&self) -> Result<Vec<MembershipPlan>> {
        Ok(self.catalog.list_plans().to_vec())
    }

    async fn get_membership_plan(&self, id: PlanId) -> Result<Option<MembershipPlan>> {
        Ok(self.catalog.get_plan(id).cloned())
    }
}

#[async_trait]
impl PaymentStore for MemoryStorage {
    #[instrument(skip(self, payment), fields(plan_id = %payment.plan_id), level = "debug")]
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment> {
        let mut tables = self.tables.write().await;
        let id = Tables::allocate(&mut tables.next_payment_id);
        let payment = Payment {
            id: PaymentId(id),
            user_id: None,
            plan_id: payment.plan_id,
            amount: payment.amount,
            cardholder_name: payment.cardholder_name,
            email: payment.email,
            status: payment.status.unwrap_or_default(),
            created_at: Utc::now(),
            stripe_subscription_id: payment.stripe_subscription_id,
            stripe_customer_id: payment.stripe_customer_id,
        };
        tables.payments.insert(id, payment.clone());
        debug!(payment_id = id, "payment created");
        Ok(payment)
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.tables.read().await.payments.get(&id.get()).cloned())
    }

    async fn update_payment_status(
        &self,
        id: PaymentId,
        status: PaymentStatus,
    ) -> Result<Payment> {
        let mut tables = self.tables.write().await;
        let payment = tables
            .payments
            .get_mut(&id.get())
            .ok_or_else(|| PortalError::NotFound(format!("Payment {id} not found")))?;
        payment.status = status;
        Ok(payment.clone())
    }

    async fn find_payment_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .find(|payment| payment.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }
}

#[async_trait]
impl MembershipStore for MemoryStorage {
    #[instrument(skip(self, membership), fields(user_id = %membership.user_id), level = "debug")]
    async fn create_user_membership(
        &self,
        membership: NewUserMembership,
    ) -> Result<UserMembership> {
        let mut tables = self.tables.write().await;
        let id = Tables::allocate(&mut tables.next_membership_id);
        let now = Utc::now();
        let membership = UserMembership {
            id: MembershipId(id),
            user_id: membership.user_id,
            plan_id: membership.plan_id,
            status: membership.status,
            start_date: now,
            end_date: membership.end_date,
            created_at: now,
            stripe_subscription_id: membership.stripe_subscription_id,
        };
        tables.memberships.insert(id, membership.clone());
        debug!(membership_id = id, "membership created");
        Ok(membership)
    }

    async fn get_user_membership(&self, user_id: UserId) -> Result<Option<UserMembership>> {
        let tables = self.tables.read().await;
        Ok(tables
            .memberships
            .values()
            .find(|membership| membership.user_id == user_id && membership.is_active())
            .cloned())
    }

    async fn get_user_membership_by_id(
        &self,
        id: MembershipId,
    ) -> Result<Option<UserMembership>> {
        Ok(self.tables.read().await.memberships.get(&id.get()).cloned())
    }

    #[instrument(skip(self, update), level = "debug")]
    async fn update_user_membership(
        &self,
        id: MembershipId,
        update: MembershipUpdate,
    ) -> Result<UserMembership> {
        let mut tables = self.tables.write().await;
        let membership = tables
            .memberships
            .get_mut(&id.get())
            .ok_or_else(|| PortalError::NotFound(format!("Membership {id} not found")))?;
        update.apply_to(membership);
        Ok(membership.clone())
    }

    async fn get_user_membership_by_email(&self, email: &str) -> Result<Option<UserMembership>> {
        let tables = self.tables.read().await;
        let Some(payment) = tables.payments.values().find(|payment| payment.email == email) else {
            return Ok(None);
        };
        Ok(tables
            .memberships
            .values()
            .find(|membership| membership.plan_id == payment.plan_id && membership.is_active())
            .cloned())
    }

    async fn find_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserMembership>> {
        let tables = self.tables.read().await;
        Ok(tables
            .memberships
            .values()
            .find(|membership| {
                membership.stripe_subscription_id.as_deref() == Some(subscription_id)
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::models::MembershipStatus;

    fn new_payment(email: &str, plan_id: u32) -> NewPayment {
        NewPayment {
            plan_id: PlanId(plan_id),
            amount: Decimal::new(999, 2),
            cardholder_name: "Ada Lovelace".into(),
            email: email.into(),
            status: None,
            stripe_subscription_id: None,
            stripe_customer_id: None,
        }
    }

    fn new_membership(user_id: u64, plan_id: u32) -> NewUserMembership {
        NewUserMembership {
            user_id: UserId(user_id),
            plan_id: PlanId(plan_id),
            status: MembershipStatus::Active,
            end_date: Utc::now() + Duration::days(30),
            stripe_subscription_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_payment_defaults() {
        let storage = MemoryStorage::default();
        let payment = storage.create_payment(new_payment("a@example.com", 1)).await.unwrap();

        assert_eq!(payment.id, PaymentId(1));
        assert_eq!(payment.user_id, None);
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_payment_round_trip() {
        let storage = MemoryStorage::default();
        let mut input = new_payment("a@example.com", 2);
        input.status = Some(PaymentStatus::Active);
        let created = storage.create_payment(input).await.unwrap();

        let fetched = storage.get_payment(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.plan_id, PlanId(2));
        assert_eq!(fetched.amount, Decimal::new(999, 2));
        assert_eq!(fetched.status, PaymentStatus::Active);
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_get_payment_missing() {
        let storage = MemoryStorage::default();
        assert!(storage.get_payment(PaymentId(42)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_payment_status_missing_is_not_found() {
        let storage = MemoryStorage::default();
        let result = storage.update_payment_status(PaymentId(9), PaymentStatus::Failed).await;
        assert!(matches!(result, Err(PortalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_user_lookup_by_username() {
        let storage = MemoryStorage::default();
        let created = storage.create_user(NewUser { username: "ada".into() }).await.unwrap();

        let found = storage.get_user_by_username("ada").await.unwrap().unwrap();
        assert_eq!(found, created);
        assert_eq!(storage.get_user(created.id).await.unwrap(), Some(created));
        assert!(storage.get_user_by_username("grace").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plan_lookup_is_idempotent() {
        let storage = MemoryStorage::default();
        let first = storage.get_membership_plan(PlanId(1)).await.unwrap();
        let second = storage.get_membership_plan(PlanId(1)).await.unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(storage.get_membership_plans().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_user_membership_without_membership() {
        let storage = MemoryStorage::default();
        assert!(storage.get_user_membership(UserId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_user_membership_returns_active_only() {
        let storage = MemoryStorage::default();
        let membership = storage.create_user_membership(new_membership(1, 1)).await.unwrap();

        let found = storage.get_user_membership(UserId(1)).await.unwrap();
        assert_eq!(found.as_ref().map(|m| m.id), Some(membership.id));

        storage
            .update_user_membership(membership.id, MembershipUpdate {
                status: Some(MembershipStatus::Cancelled),
                ..MembershipUpdate::default()
            })
            .await
            .unwrap();

        assert!(storage.get_user_membership(UserId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_membership_stamps_start_date() {
        let storage = MemoryStorage::default();
        let membership = storage.create_user_membership(new_membership(1, 1)).await.unwrap();
        assert_eq!(membership.start_date, membership.created_at);
    }

    #[tokio::test]
    async fn test_update_membership_missing_is_not_found() {
        let storage = MemoryStorage::default();
        let result =
            storage.update_user_membership(MembershipId(5), MembershipUpdate::default()).await;
        assert!(matches!(result, Err(PortalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_membership_keeps_start_date() {
        let storage = MemoryStorage::default();
        let membership = storage.create_user_membership(new_membership(1, 1)).await.unwrap();
        let new_end = membership.end_date + Duration::days(365);

        let updated = storage
            .update_user_membership(membership.id, MembershipUpdate {
                plan_id: Some(PlanId(2)),
                end_date: Some(new_end),
                ..MembershipUpdate::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.plan_id, PlanId(2));
        assert_eq!(updated.end_date, new_end);
        assert_eq!(updated.start_date, membership.start_date);
    }

    #[tokio::test]
    async fn test_membership_by_email_join() {
        let storage = MemoryStorage::default();
        assert!(storage.get_user_membership_by_email("a@example.com").await.unwrap().is_none());

        storage.create_payment(new_payment("a@example.com", 1)).await.unwrap();
        assert!(storage.get_user_membership_by_email("a@example.com").await.unwrap().is_none());

        let membership = storage.create_user_membership(new_membership(1, 1)).await.unwrap();
        let found = storage.get_user_membership_by_email("a@example.com").await.unwrap();
        assert_eq!(found.map(|m| m.id), Some(membership.id));
    }

    #[tokio::test]
    async fn test_membership_by_email_matches_on_plan_only() {
        // Two members on the same plan: the join cannot tell them apart.
        let storage = MemoryStorage::default();
        let first = storage.create_user_membership(new_membership(1, 1)).await.unwrap();
        storage.create_user_membership(new_membership(2, 1)).await.unwrap();
        storage.create_payment(new_payment("second@example.com", 1)).await.unwrap();

        let found = storage.get_user_membership_by_email("second@example.com").await.unwrap();
        assert_eq!(found.map(|m| m.id), Some(first.id));
    }

    #[tokio::test]
    async fn test_find_by_subscription() {
        let storage = MemoryStorage::default();
        let mut payment = new_payment("a@example.com", 1);
        payment.stripe_subscription_id = Some("sub_123".into());
        let payment = storage.create_payment(payment).await.unwrap();

        let mut membership = new_membership(1, 1);
        membership.stripe_subscription_id = Some("sub_123".into());
        let membership = storage.create_user_membership(membership).await.unwrap();

        let found_payment = storage.find_payment_by_subscription("sub_123").await.unwrap();
        let found_membership = storage.find_membership_by_subscription("sub_123").await.unwrap();
        assert_eq!(found_payment.map(|p| p.id), Some(payment.id));
        assert_eq!(found_membership.map(|m| m.id), Some(membership.id));
        assert!(storage.find_payment_by_subscription("sub_other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_tables() {
        let storage = MemoryStorage::default();
        let clone = storage.clone();
        storage.create_payment(new_payment("a@example.com", 1)).await.unwrap();
        assert_eq!(clone.payment_count().await, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_ids_strictly_increasing(count in 1usize..50) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let ids = runtime.block_on(async {
                let storage = MemoryStorage::default();
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    let payment = storage.create_payment(new_payment("p@example.com", 1)).await.unwrap();
                    ids.push(payment.id.get());
                }
                ids
            });

            prop_assert_eq!(ids[0], 1);
            prop_assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        }

        #[test]
        fn test_membership_ids_never_reused(count in 1usize..30) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let ids = runtime.block_on(async {
                let storage = MemoryStorage::default();
                let mut ids = Vec::with_capacity(count);
                for index in 0..count {
                    let membership = storage
                        .create_user_membership(new_membership(index as u64 + 1, 1))
                        .await
                        .unwrap();
                    storage
                        .update_user_membership(membership.id, MembershipUpdate {
                            status: Some(MembershipStatus::Cancelled),
                            ..MembershipUpdate::default()
                        })
                        .await
                        .unwrap();
                    ids.push(membership.id.get());
                }
                ids
            });

            prop_assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
