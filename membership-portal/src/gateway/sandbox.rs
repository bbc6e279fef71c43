//! In-process billing fake.
//!
//! Ids are deterministic (`cus_sandbox_1`, `sub_sandbox_1`, `pi_sandbox_1`)
//! and every call is recorded so tests can assert on what reached the
//! provider. Customers are remembered by email like the real provider would.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::debug;

use super::{
    BillingGateway, CustomerRef, OneOffCharge, OneOffChargeRequest, RecurringCharge,
    RecurringChargeRequest,
};
use crate::error::GatewayError;

/// A call observed by [`SandboxGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `find_or_create_customer(email, _)`.
    Customer {
        /// Email looked up.
        email: String,
    },
    /// `create_recurring_charge`.
    Recurring(RecurringChargeRequest),
    /// `create_one_off_charge`.
    OneOff(OneOffChargeRequest),
}

/// [`BillingGateway`] that never leaves the process.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    counter: AtomicU64,
    fail_next: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    customers: Mutex<HashMap<String, CustomerRef>>,
    calls: Mutex<Vec<GatewayCall>>,
    decline_all: AtomicBool,
}

impl SandboxGateway {
    /// Creates an empty sandbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *lock(&self.fail_next) = Some(message.to_owned());
    }

    /// Makes every call fail until switched off again.
    pub fn set_decline_all(&self, decline: bool) {
        self.decline_all.store(decline, Ordering::SeqCst);
    }

    /// Delays every call by `delay`, to exercise caller timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// Returns every call made so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.calls).clone()
    }

    /// Returns only the one-off charges made so far.
    #[must_use]
    pub fn one_off_charges(&self) -> Vec<OneOffChargeRequest> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                GatewayCall::OneOff(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}_sandbox_{n}")
    }

    async fn enter(&self, call: GatewayCall) -> Result<(), GatewayError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        lock(&self.calls).push(call);

        if let Some(message) = lock(&self.fail_next).take() {
            return Err(GatewayError::new(message));
        }
        if self.decline_all.load(Ordering::SeqCst) {
            return Err(GatewayError::new("Your card was declined."));
        }
        Ok(())
    }
}

// A poisoned lock only means a test panicked mid-call; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl BillingGateway for SandboxGateway {
    async fn find_or_create_customer(
        &self,
        email: &str,
        _name: &str,
    ) -> Result<CustomerRef, GatewayError> {
        self.enter(GatewayCall::Customer { email: email.to_owned() }).await?;

        if let Some(existing) = lock(&self.customers).get(email) {
            return Ok(existing.clone());
        }
        let customer = CustomerRef { id: self.next_id("cus") };
        lock(&self.customers).insert(email.to_owned(), customer.clone());
        debug!(customer_id = %customer.id, "sandbox customer created");
        Ok(customer)
    }

    async fn create_recurring_charge(
        &self,
        request: RecurringChargeRequest,
    ) -> Result<RecurringCharge, GatewayError> {
        self.enter(GatewayCall::Recurring(request)).await?;

        let subscription_id = self.next_id("sub");
        Ok(RecurringCharge {
            client_secret: Some(format!("{subscription_id}_secret")),
            subscription_id,
            status: "incomplete".to_owned(),
        })
    }

    async fn create_one_off_charge(
        &self,
        request: OneOffChargeRequest,
    ) -> Result<OneOffCharge, GatewayError> {
        let amount_minor = request.amount_minor;
        self.enter(GatewayCall::OneOff(request)).await?;

        if amount_minor <= 0 {
            return Err(GatewayError::new("charge amount must be positive"));
        }
        let payment_intent_id = self.next_id("pi");
        Ok(OneOffCharge {
            client_secret: Some(format!("{payment_intent_id}_secret")),
            payment_intent_id,
        })
    }

    fn name(&self) -> &'static str {
        "sandbox"
    }
}
