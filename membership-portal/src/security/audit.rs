//! Audit logging for billing and membership events.
//!
//! Every entry goes to the `audit` tracing target with a correlation id.
//! Emails are partially masked and error text is scrubbed of card-like
//! digit runs and CVC values before it is recorded.

use std::time::{Duration, SystemTime};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A purchase created a subscription and a membership.
    PurchaseSucceeded,
    /// A purchase was rejected by validation or the billing provider.
    PurchaseFailed,
    /// A membership moved to another plan.
    PlanChanged,
    /// A plan change was rejected.
    PlanChangeFailed,
    /// A membership was cancelled by request or by the provider.
    MembershipCancelled,
    /// A signed provider event was accepted.
    WebhookAccepted,
    /// A provider event failed signature verification.
    WebhookRejected,
    /// A caller hit the rate limit.
    RateLimitExceeded,
}

/// Context attached to an [`AuditEvent`]; unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDetails {
    /// Masked member email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Plan involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<u32>,
    /// Membership involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub membership_id: Option<u64>,
    /// Payment involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<u64>,
    /// Amount charged, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// Provider event id or type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_event: Option<String>,
    /// Scrubbed error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operation duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// One audit log entry.
///
/// ```
/// use membership_portal::security::audit::{AuditEvent, AuditEventType, audit_log};
/// use uuid::Uuid;
///
/// let event = AuditEvent::new(AuditEventType::PlanChanged, Uuid::new_v4())
///     .with_membership_id(7)
///     .with_plan_id(2);
/// audit_log(&event);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub timestamp: SystemTime,
    /// What happened.
    pub event_type: AuditEventType,
    /// Correlation id.
    pub request_id: Uuid,
    /// Context.
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Creates an event with empty details.
    #[must_use]
    pub fn new(event_type: AuditEventType, request_id: Uuid) -> Self {
        Self { timestamp: SystemTime::now(), event_type, request_id, details: AuditDetails::default() }
    }

    /// Records the member email, masked with [`redact_email`].
    #[must_use]
    pub fn with_email(mut self, email: &str) -> Self {
        self.details.email = Some(redact_email(email));
        self
    }

    /// Records the plan id.
    #[must_use]
    pub const fn with_plan_id(mut self, plan_id: u32) -> Self {
        self.details.plan_id = Some(plan_id);
        self
    }

    /// Records the membership id.
    #[must_use]
    pub const fn with_membership_id(mut self, membership_id: u64) -> Self {
        self.details.membership_id = Some(membership_id);
        self
    }

    /// Records the payment id.
    #[must_use]
    pub const fn with_payment_id(mut self, payment_id: u64) -> Self {
        self.details.payment_id = Some(payment_id);
        self
    }

    /// Records a charged amount.
    #[must_use]
    pub const fn with_amount(mut self, amount: Decimal) -> Self {
        self.details.amount = Some(amount);
        self
    }

    /// Records a provider event id or type.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_provider_event(mut self, event: impl Into<String>) -> Self {
        self.details.provider_event = Some(event.into());
        self
    }

    /// Records an error message after passing it through [`redact_sensitive`].
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.details.error = Some(redact_sensitive(error));
        self
    }

    /// Records how long the operation took.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "duration in ms fits u64 for practical values"
    )]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.details.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Emits `event` on the `audit` tracing target.
pub fn audit_log(event: &AuditEvent) {
    tracing::info!(
        target: "audit",
        timestamp = ?event.timestamp,
        event_type = ?event.event_type,
        request_id = %event.request_id,
        details = ?event.details,
        "AUDIT"
    );
}

const CARD_MASK: &str = "XXXX-XXXX-XXXX-XXXX";
const CVC_KEYWORDS: [&str; 4] = ["cvv", "cvc", "cvv2", "cid"];

/// Masks card-like digit runs and CVC values in free text.
///
/// A run of 13 to 19 digits, optionally split by single spaces or hyphens,
/// becomes `XXXX-XXXX-XXXX-XXXX`. Three or four digits following a
/// `cvv`/`cvc`/`cvv2`/`cid` keyword and a `:` `=` or space become `XXX`.
///
/// ```
/// use membership_portal::security::audit::redact_sensitive;
///
/// let redacted = redact_sensitive("declined for 4242 4242 4242 4242, cvc: 123");
/// assert_eq!(redacted, "declined for XXXX-XXXX-XXXX-XXXX, cvc: XXX");
/// ```
#[must_use]
pub fn redact_sensitive(input: &str) -> String {
    mask_cvc(&mask_card_numbers(input))
}

fn mask_card_numbers(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        // Extend over digits and single separators that sit between digits.
        let start = i;
        let mut end = i;
        let mut digits = 0;
        let mut j = i;
        while j < chars.len() {
            if chars[j].is_ascii_digit() {
                digits += 1;
                j += 1;
                end = j;
            } else if (chars[j] == ' ' || chars[j] == '-')
                && chars.get(j + 1).is_some_and(char::is_ascii_digit)
            {
                j += 1;
            } else {
                break;
            }
        }

        if (13..=19).contains(&digits) {
            out.push_str(CARD_MASK);
        } else {
            out.extend(&chars[start..end]);
        }
        i = end;
    }

    out
}

fn mask_cvc(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let lower: Vec<char> = input.to_lowercase().chars().collect();
    if lower.len() != chars.len() {
        return input.to_owned();
    }

    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    'scan: while i < chars.len() {
        for keyword in CVC_KEYWORDS {
            let kw: Vec<char> = keyword.chars().collect();
            let at_word_start = i == 0 || !lower[i - 1].is_ascii_alphanumeric();
            if !at_word_start || !lower[i..].starts_with(&kw) {
                continue;
            }

            let mut j = i + kw.len();
            let sep_start = j;
            while j < chars.len() && matches!(chars[j], ':' | '=' | ' ') {
                j += 1;
            }
            let digits_end =
                (j..chars.len()).find(|&k| !chars[k].is_ascii_digit()).unwrap_or(chars.len());
            let digit_count = digits_end - j;

            if j > sep_start && (3..=4).contains(&digit_count) {
                out.extend(&chars[i..j]);
                out.push_str("XXX");
                i = digits_end;
                continue 'scan;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

/// Masks the local part of an email, keeping its first character and the domain.
///
/// ```
/// use membership_portal::security::audit::redact_email;
///
/// assert_eq!(redact_email("ada@example.com"), "a**@example.com");
/// assert_eq!(redact_email("not-an-email"), "***");
/// ```
#[must_use]
pub fn redact_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return "***".to_owned();
    };
    let mut chars = local.chars();
    let Some(first) = chars.next() else {
        return format!("***@{domain}");
    };
    let hidden = chars.count().max(1);
    format!("{first}{}@{domain}", "*".repeat(hidden))
}

/// Builds and logs an [`AuditEvent`] in one expression.
///
/// ```
/// use membership_portal::{audit, security::audit::AuditEventType};
/// use uuid::Uuid;
///
/// audit!(AuditEventType::MembershipCancelled, Uuid::new_v4(), with_membership_id(3));
/// ```
#[macro_export]
macro_rules! audit {
    ($event_type:expr, $request_id:expr) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $request_id)
        )
    };
    ($event_type:expr, $request_id:expr, $($method:ident($($arg:expr),*)),+ $(,)?) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $request_id)
                $(.$method($($arg),*))+
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_card_formats() {
        let inputs = [
            ("Card: 4242-4242-4242-4242", "Card: XXXX-XXXX-XXXX-XXXX"),
            ("Card: 4242 4242 4242 4242", "Card: XXXX-XXXX-XXXX-XXXX"),
            ("Card: 4242424242424242", "Card: XXXX-XXXX-XXXX-XXXX"),
            ("Amex 378282246310005 declined", "Amex XXXX-XXXX-XXXX-XXXX declined"),
        ];

        for (input, expected) in inputs {
            assert_eq!(redact_sensitive(input), expected, "failed to redact: {input}");
        }
    }

    #[test]
    fn test_redact_multiple_cards() {
        let result = redact_sensitive("Cards: 4242-4242-4242-4242 and 5555 5555 5555 4444");
        assert_eq!(result, "Cards: XXXX-XXXX-XXXX-XXXX and XXXX-XXXX-XXXX-XXXX");
    }

    #[test]
    fn test_redact_cvc_variants() {
        assert_eq!(redact_sensitive("CVV: 123"), "CVV: XXX");
        assert_eq!(redact_sensitive("cvc=4567"), "cvc=XXX");
        assert_eq!(redact_sensitive("bad cvc 999 given"), "bad cvc XXX given");
        assert_eq!(redact_sensitive("cvc:12"), "cvc:12");
    }

    #[test]
    fn test_redact_preserves_safe_text() {
        let input = "Order 12345, amount 67.89, date 2024-01-15, expiry 12/30";
        assert_eq!(redact_sensitive(input), input);
        assert_eq!(redact_sensitive(""), "");
    }

    #[test]
    fn test_redact_email() {
        assert_eq!(redact_email("ada@example.com"), "a**@example.com");
        assert_eq!(redact_email("a@example.com"), "a*@example.com");
        assert_eq!(redact_email("@example.com"), "***@example.com");
        assert_eq!(redact_email("plain"), "***");
    }

    #[test]
    fn test_event_builder() {
        let request_id = Uuid::new_v4();
        let event = AuditEvent::new(AuditEventType::PurchaseSucceeded, request_id)
            .with_email("grace@example.com")
            .with_plan_id(2)
            .with_payment_id(10)
            .with_membership_id(4)
            .with_amount(Decimal::new(9999, 2))
            .with_duration(Duration::from_millis(1500));

        assert_eq!(event.request_id, request_id);
        assert_eq!(event.details.email.as_deref(), Some("g****@example.com"));
        assert_eq!(event.details.plan_id, Some(2));
        assert_eq!(event.details.payment_id, Some(10));
        assert_eq!(event.details.membership_id, Some(4));
        assert_eq!(event.details.duration_ms, Some(1500));
    }

    #[test]
    fn test_event_error_is_scrubbed() {
        let event = AuditEvent::new(AuditEventType::PurchaseFailed, Uuid::new_v4())
            .with_error("card 4000 0000 0000 0002 declined, cvc: 321");

        let error = event.details.error.unwrap();
        assert!(!error.contains("4000 0000 0000 0002"));
        assert!(!error.contains("321"));
        assert!(error.contains("declined"));
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(AuditEventType::WebhookAccepted, Uuid::new_v4())
            .with_provider_event("evt_123");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("webhook_accepted"));
        assert!(json.contains("evt_123"));
        assert!(!json.contains("email"));
    }
}
