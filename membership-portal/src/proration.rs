//! Plan-change proration.
//!
//! All functions take `now` explicitly so callers compute it once per
//! operation.
//!
//! A change is an upgrade when the new plan's *total* price is higher, even
//! if its daily rate is lower. In that case the prorated amount is the daily
//! rate difference times the remaining days and can come out negative; a
//! non-positive amount is never charged. Downgrades and same-price changes
//! cost nothing and earn no credit. The new validity window always starts at
//! `now`, discarding whatever was left of the old one.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::{
    error::{PortalError, Result},
    models::MembershipPlan,
};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Direction of a plan change, by total price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    /// New plan costs more.
    Upgrade,
    /// New plan costs less.
    Downgrade,
    /// Both plans cost the same.
    SamePrice,
}

impl PlanChangeKind {
    /// Classifies a move from `current` to `new`.
    #[must_use]
    pub fn classify(current: &MembershipPlan, new: &MembershipPlan) -> Self {
        match new.price.cmp(&current.price) {
            std::cmp::Ordering::Greater => Self::Upgrade,
            std::cmp::Ordering::Less => Self::Downgrade,
            std::cmp::Ordering::Equal => Self::SamePrice,
        }
    }
}

/// Result of pricing a plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProrationQuote {
    /// Direction of the change.
    pub kind: PlanChangeKind,
    /// Whole days left on the current window, never negative.
    pub days_remaining: i64,
    /// Rounded to cents; zero unless `kind` is [`PlanChangeKind::Upgrade`].
    pub amount: Decimal,
}

impl ProrationQuote {
    /// Returns `true` when the quote calls for a one-off charge.
    #[must_use]
    pub fn requires_charge(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

/// Whole days from `now` until `end_date`, rounded up.
///
/// Negative once the window has lapsed; [`quote`] clamps to zero.
#[must_use]
pub fn days_remaining(end_date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (end_date - now).num_milliseconds();
    let days = millis / MILLIS_PER_DAY;
    // Integer division already rounds toward +inf for negative spans.
    if millis > 0 && millis % MILLIS_PER_DAY != 0 { days + 1 } else { days }
}

/// Daily rate difference times `days`, rounded half away from zero to cents.
#[must_use]
pub fn prorated_amount(current: &MembershipPlan, new: &MembershipPlan, days: i64) -> Decimal {
    ((new.daily_rate() - current.daily_rate()) * Decimal::from(days))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Prices a change from `current` to `new` for a window ending at `end_date`.
#[must_use]
pub fn quote(
    current: &MembershipPlan,
    new: &MembershipPlan,
    end_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ProrationQuote {
    let kind = PlanChangeKind::classify(current, new);
    let days_remaining = days_remaining(end_date, now).max(0);
    let amount = match kind {
        PlanChangeKind::Upgrade => prorated_amount(current, new, days_remaining),
        PlanChangeKind::Downgrade | PlanChangeKind::SamePrice => Decimal::ZERO,
    };
    ProrationQuote { kind, days_remaining, amount }
}

/// End of a fresh validity window for `plan` starting at `now`.
///
/// # Errors
///
/// Returns [`PortalError::Internal`] if the window runs past the calendar
/// range `chrono` can represent.
pub fn end_date_for(plan: &MembershipPlan, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    now.checked_add_signed(Duration::days(i64::from(plan.validity_days))).ok_or_else(|| {
        PortalError::Internal(format!(
            "validity of plan {} overflows the calendar",
            plan.id
        ))
    })
}
