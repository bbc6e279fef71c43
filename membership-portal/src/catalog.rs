//! Seeded, read-only membership plan catalog.
//!
//! The catalog is built once at process start and never mutated. Ids are
//! assigned at seed time in insertion order starting at 1.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    error::{PortalError, Result},
    models::{MembershipPlan, PlanId, PlanType},
};

/// Longest validity window a configured plan may declare (100 years).
pub const MAX_VALIDITY_DAYS: u32 = 36_500;

/// Plan definition as written in the `[[plans]]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanSeed {
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
    #[serde(default)]
    pub features: Vec<String>,
}

impl PlanSeed {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PortalError::Config("plan name cannot be empty".into()));
        }
        if self.price <= Decimal::ZERO {
            return Err(PortalError::Config(format!(
                "plan '{}' must have a positive price",
                self.name
            )));
        }
        if self.validity_days == 0 || self.validity_days > MAX_VALIDITY_DAYS {
            return Err(PortalError::Config(format!(
                "plan '{}' must have validity_days between 1 and {MAX_VALIDITY_DAYS}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Ordered list of purchasable plans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    plans: Vec<MembershipPlan>,
}

impl PlanCatalog {
    /// Wraps plans as-is, skipping seed validation.
    #[cfg(test)]
    pub(crate) fn from_plans_unchecked(plans: Vec<MembershipPlan>) -> Self {
        Self { plans }
    }

    /// Builds a catalog from seed entries, assigning ids 1, 2, ... in order.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] if any entry has an empty name, a
    /// non-positive price, or zero validity days.
    pub fn from_seeds(seeds: Vec<PlanSeed>) -> Result<Self> {
        let mut plans = Vec::with_capacity(seeds.len());
        for (index, seed) in seeds.into_iter().enumerate() {
            seed.validate()?;
            let id = u32::try_from(index + 1)
                .map_err(|_| PortalError::Config("too many plans".into()))?;
            plans.push(MembershipPlan {
                id: PlanId(id),
                name: seed.name,
                plan_type: seed.plan_type,
                price: seed.price,
                validity_days: seed.validity_days,
                features: seed.features,
            });
        }
        Ok(Self { plans })
    }

    /// Returns the built-in monthly and annual plans.
    #[must_use]
    pub fn seeded() -> Self {
        let plans = vec![
            MembershipPlan {
                id: PlanId(1),
                name: "Monthly Membership".to_owned(),
                plan_type: PlanType::Monthly,
                price: Decimal::new(999, 2),
                validity_days: 30,
                features: vec![
                    "Unlimited gym access".to_owned(),
                    "Group fitness classes".to_owned(),
                    "Locker room access".to_owned(),
                    "Cancel anytime".to_owned(),
                ],
            },
            MembershipPlan {
                id: PlanId(2),
                name: "Annual Membership".to_owned(),
                plan_type: PlanType::Annual,
                price: Decimal::new(9999, 2),
                validity_days: 365,
                features: vec![
                    "Unlimited gym access".to_owned(),
                    "Group fitness classes".to_owned(),
                    "Locker room access".to_owned(),
                    "Two months free".to_owned(),
                    "Free personal training session".to_owned(),
                ],
            },
        ];
        Self { plans }
    }

    /// Returns all plans in insertion order.
    #[must_use]
    pub fn list_plans(&self) -> &[MembershipPlan] {
        &self.plans
    }

    /// Looks a plan up by exact id.
    #[must_use]
    pub fn get_plan(&self, id: PlanId) -> Option<&MembershipPlan> {
        self.plans.iter().find(|plan| plan.id == id)
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::seeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_catalog_is_stable() {
        let catalog = PlanCatalog::seeded();
        let first = catalog.list_plans().to_vec();
        let second = catalog.list_plans().to_vec();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(first[0].id, PlanId(1));
        assert_eq!(first[0].plan_type, PlanType::Monthly);
        assert_eq!(first[1].id, PlanId(2));
        assert_eq!(first[1].price, Decimal::new(9999, 2));
        assert_eq!(first[1].validity_days, 365);
    }

    #[test]
    fn test_get_plan_exact_match() {
        let catalog = PlanCatalog::seeded();
        assert_eq!(catalog.get_plan(PlanId(2)).map(|p| p.name.as_str()), Some("Annual Membership"));
        assert!(catalog.get_plan(PlanId(3)).is_none());
        assert!(catalog.get_plan(PlanId(0)).is_none());
    }

    #[test]
    fn test_from_seeds_assigns_ids_in_order() {
        let toml = r#"
            [[plans]]
            name = "Basic"
            type = "monthly"
            price = "5.00"
            validity_days = 30

            [[plans]]
            name = "Pro"
            type = "annual"
            price = "50.00"
            validity_days = 365
            features = ["Everything"]
        "#;

        #[derive(Deserialize)]
        struct Wrapper {
            plans: Vec<PlanSeed>,
        }

        let wrapper: Wrapper = toml::from_str(toml).unwrap();
        let catalog = PlanCatalog::from_seeds(wrapper.plans).unwrap();

        assert_eq!(catalog.list_plans().len(), 2);
        assert_eq!(catalog.list_plans()[0].id, PlanId(1));
        assert_eq!(catalog.list_plans()[1].id, PlanId(2));
        assert_eq!(catalog.list_plans()[1].features, vec!["Everything".to_owned()]);
    }

    #[test]
    fn test_from_seeds_rejects_zero_validity() {
        let seed = PlanSeed {
            name: "Broken".into(),
            plan_type: PlanType::Monthly,
            price: Decimal::new(100, 2),
            validity_days: 0,
            features: vec![],
        };
        let result = PlanCatalog::from_seeds(vec![seed]);
        assert!(matches!(result, Err(PortalError::Config(_))));
    }

    #[test]
    fn test_from_seeds_rejects_validity_past_bound() {
        let seed = |days| PlanSeed {
            name: "Forever".into(),
            plan_type: PlanType::Annual,
            price: Decimal::new(100, 2),
            validity_days: days,
            features: vec![],
        };
        assert!(PlanCatalog::from_seeds(vec![seed(MAX_VALIDITY_DAYS)]).is_ok());
        let result = PlanCatalog::from_seeds(vec![seed(200_000_000)]);
        assert!(matches!(result, Err(PortalError::Config(_))));
    }

    #[test]
    fn test_from_seeds_rejects_non_positive_price() {
        let seed = PlanSeed {
            name: "Free".into(),
            plan_type: PlanType::Monthly,
            price: Decimal::ZERO,
            validity_days: 30,
            features: vec![],
        };
        assert!(PlanCatalog::from_seeds(vec![seed]).is_err());
    }
}
