//! Provider webhook verification and event application.
//!
//! The `Stripe-Signature` header carries `t=<unix seconds>` and one or more
//! `v1=<hex>` entries. Each `v1` is an HMAC-SHA256 over `"{t}.{body}"` keyed
//! by the endpoint secret; any one matching is enough. Deliveries older than
//! the tolerance are rejected so a captured request cannot be replayed later.
//!
//! Event ids are remembered in a bounded LRU so redelivered events are
//! acknowledged without being applied twice.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use hmac::{Hmac, Mac};
use lru::LruCache;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    audit,
    error::{PortalError, Result},
    lifecycle::MembershipService,
    models::PaymentStatus,
    security::audit::AuditEventType,
};

type HmacSha256 = Hmac<Sha256>;

/// Default maximum age of a signed delivery.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

const DEFAULT_DEDUPE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

/// Checks `Stripe-Signature` headers against the endpoint secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Zeroizing<String>,
    tolerance: Duration,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier {
    /// Creates a verifier with [`DEFAULT_TOLERANCE`].
    #[must_use]
    pub fn new(secret: Zeroizing<String>) -> Self {
        Self { secret, tolerance: DEFAULT_TOLERANCE }
    }

    /// Overrides the maximum delivery age.
    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Verifies `header` for `payload` against the current clock.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::WebhookSignature`] if the header is malformed,
    /// stale, or carries no matching signature.
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PortalError::Internal(format!("system clock before epoch: {e}")))?
            .as_secs();
        self.verify_at(payload, header, now)
    }

    /// Verifies `header` for `payload` as of `now` (unix seconds).
    ///
    /// # Errors
    ///
    /// See [`verify`](Self::verify).
    pub fn verify_at(&self, payload: &[u8], header: &str, now: u64) -> Result<()> {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<u64>().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| PortalError::WebhookSignature("missing timestamp".to_owned()))?;
        if candidates.is_empty() {
            return Err(PortalError::WebhookSignature("missing v1 signature".to_owned()));
        }
        if now.abs_diff(timestamp) > self.tolerance.as_secs() {
            return Err(PortalError::WebhookSignature("timestamp outside tolerance".to_owned()));
        }

        let expected = hex::encode(self.sign(timestamp, payload)?);
        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
        if matched {
            Ok(())
        } else {
            Err(PortalError::WebhookSignature("no matching signature".to_owned()))
        }
    }

    /// Computes the raw signature for `payload` at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Internal`] if the secret cannot key the MAC.
    pub fn sign(&self, timestamp: u64, payload: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| PortalError::Internal(format!("invalid webhook secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Builds a complete header value, for clients and tests.
    ///
    /// # Errors
    ///
    /// See [`sign`](Self::sign).
    pub fn header_for(&self, timestamp: u64, payload: &[u8]) -> Result<String> {
        Ok(format!("t={timestamp},v1={}", hex::encode(self.sign(timestamp, payload)?)))
    }
}

/// Envelope of a provider event.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    /// Unique event id.
    pub id: String,
    /// Dotted event type such as `invoice.paid`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: EventData,
}

/// `data` member of a [`ProviderEvent`].
#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    /// The object the event is about.
    pub object: EventObject,
}

/// The fields this service reads from an event object.
#[derive(Debug, Clone, Deserialize)]
pub struct EventObject {
    /// Object id; the subscription id for subscription events.
    pub id: Option<String>,
    /// Subscription an invoice belongs to.
    pub subscription: Option<String>,
}

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event changed stored state.
    Applied,
    /// The event was understood but referenced nothing stored.
    Unmatched,
    /// The event id was already processed.
    Duplicate,
    /// The event type is not handled.
    Ignored,
}

/// Verifies deliveries and applies them through the lifecycle service.
pub struct WebhookProcessor {
    verifier: Option<SignatureVerifier>,
    service: Arc<MembershipService>,
    seen: Mutex<LruCache<String, ()>>,
}

impl fmt::Debug for WebhookProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookProcessor")
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

impl WebhookProcessor {
    /// Creates a processor. Without a verifier every delivery fails.
    #[must_use]
    pub fn new(service: Arc<MembershipService>, verifier: Option<SignatureVerifier>) -> Self {
        Self { verifier, service, seen: Mutex::new(LruCache::new(DEFAULT_DEDUPE_CAPACITY)) }
    }

    /// Verifies, parses, deduplicates, and applies one delivery.
    ///
    /// # Errors
    ///
    /// - [`PortalError::Internal`] if no webhook secret is configured
    /// - [`PortalError::WebhookSignature`] if verification fails
    /// - [`PortalError::Validation`] if the body is not an event
    #[instrument(skip(self, payload, signature))]
    pub async fn handle(&self, payload: &[u8], signature: Option<&str>) -> Result<WebhookOutcome> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| PortalError::Internal("webhook secret is not configured".to_owned()))?;

        let verified = signature
            .ok_or_else(|| PortalError::WebhookSignature("missing Stripe-Signature header".to_owned()))
            .and_then(|header| verifier.verify(payload, header));
        if let Err(err) = verified {
            warn!(error = %err, "webhook rejected");
            audit!(AuditEventType::WebhookRejected, Uuid::new_v4(), with_error(&err.to_string()));
            return Err(err);
        }

        let event: ProviderEvent = serde_json::from_slice(payload)
            .map_err(|e| PortalError::Validation(format!("invalid event payload: {e}")))?;

        if !self.claim(&event.id) {
            debug!(event_id = %event.id, "duplicate event acknowledged");
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match self.apply(&event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Forget the id so the provider's retry is applied.
                self.release(&event.id);
                return Err(err);
            }
        };

        audit!(
            AuditEventType::WebhookAccepted,
            Uuid::new_v4(),
            with_provider_event(format!("{} {}", event.event_type, event.id)),
        );
        Ok(outcome)
    }

    async fn apply(&self, event: &ProviderEvent) -> Result<WebhookOutcome> {
        let object = &event.data.object;
        let changed = match event.event_type.as_str() {
            "invoice.paid" | "invoice.payment_succeeded" => {
                let Some(subscription) = object.subscription.as_deref() else {
                    return Ok(WebhookOutcome::Unmatched);
                };
                self.service
                    .record_invoice_outcome(subscription, PaymentStatus::Completed)
                    .await?
                    .is_some()
            }
            "invoice.payment_failed" => {
                let Some(subscription) = object.subscription.as_deref() else {
                    return Ok(WebhookOutcome::Unmatched);
                };
                self.service
                    .record_invoice_outcome(subscription, PaymentStatus::Failed)
                    .await?
                    .is_some()
            }
            "customer.subscription.deleted" => {
                let Some(subscription) = object.id.as_deref() else {
                    return Ok(WebhookOutcome::Unmatched);
                };
                self.service.end_subscription(subscription).await?.is_some()
            }
            other => {
                info!(event_type = other, "unhandled event type acknowledged");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        Ok(if changed { WebhookOutcome::Applied } else { WebhookOutcome::Unmatched })
    }

    /// Records `event_id` and returns `true` on its first delivery.
    ///
    /// Lookup and insert share one lock so concurrent redeliveries of the
    /// same event cannot both be applied.
    fn claim(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.get(event_id).is_some() {
            return false;
        }
        seen.put(event_id.to_owned(), ());
        true
    }

    fn release(&self, event_id: &str) {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).pop(event_id);
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::{
        checkout::CheckoutRequest,
        gateway::SandboxGateway,
        models::{MembershipStatus, PlanId},
        storage::{MembershipStore, MemoryStorage, PaymentStore},
    };

    const SECRET: &str = "whsec_test_secret";

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(Zeroizing::new(SECRET.to_owned()))
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn test_verify_accepts_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().header_for(1_700_000_000, payload).unwrap();
        assert!(verifier().verify_at(payload, &header, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_verify_matches_independent_hmac() {
        let payload = b"{\"type\":\"test\"}";
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(b"1614556800.{\"type\":\"test\"}");
        let signature = hex::encode(mac.finalize().into_bytes());

        let header = format!("t=1614556800,v1=deadbeef,v1={signature}");
        assert!(verifier().verify_at(payload, &header, 1_614_556_900).is_ok());
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let header = verifier().header_for(1_700_000_000, b"original").unwrap();
        let result = verifier().verify_at(b"tampered", &header, 1_700_000_000);
        assert!(matches!(result, Err(PortalError::WebhookSignature(_))));
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let header = verifier().header_for(1_700_000_000, b"body").unwrap();
        let result = verifier().verify_at(b"body", &header, 1_700_000_301);
        assert!(matches!(result, Err(PortalError::WebhookSignature(_))));
    }

    #[test]
    fn test_verify_rejects_malformed_headers() {
        for header in ["", "t=abc,v1=00", "v1=00", "t=1700000000"] {
            assert!(verifier().verify_at(b"body", header, 1_700_000_000).is_err(), "{header}");
        }
    }

    #[test]
    fn test_debug_hides_secret() {
        assert!(!format!("{:?}", verifier()).contains(SECRET));
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        service: Arc<MembershipService>,
        processor: WebhookProcessor,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::default());
        let service =
            Arc::new(MembershipService::new(storage.clone(), Arc::new(SandboxGateway::new())));
        let processor = WebhookProcessor::new(Arc::clone(&service), Some(verifier()));
        Fixture { storage, service, processor }
    }

    fn signed(body: &str) -> (Vec<u8>, String) {
        let header = verifier().header_for(now(), body.as_bytes()).unwrap();
        (body.as_bytes().to_vec(), header)
    }

    async fn purchase(fixture: &Fixture) -> String {
        let outcome = fixture
            .service
            .purchase(CheckoutRequest {
                plan_id: PlanId(1),
                amount: Decimal::new(999, 2),
                cardholder_name: "Ada".into(),
                email: "ada@example.com".into(),
            })
            .await
            .unwrap();
        outcome.subscription.subscription_id
    }

    #[tokio::test]
    async fn test_invoice_paid_completes_payment() {
        let f = fixture();
        let subscription = purchase(&f).await;
        let body = format!(
            r#"{{"id":"evt_1","type":"invoice.paid","data":{{"object":{{"id":"in_1","subscription":"{subscription}"}}}}}}"#
        );
        let (payload, header) = signed(&body);

        let outcome = f.processor.handle(&payload, Some(&header)).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let payment = f.storage.find_payment_by_subscription(&subscription).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_payment_failed_marks_payment() {
        let f = fixture();
        let subscription = purchase(&f).await;
        let body = format!(
            r#"{{"id":"evt_2","type":"invoice.payment_failed","data":{{"object":{{"subscription":"{subscription}"}}}}}}"#
        );
        let (payload, header) = signed(&body);

        f.processor.handle(&payload, Some(&header)).await.unwrap();
        let payment = f.storage.find_payment_by_subscription(&subscription).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_subscription_deleted_cancels_membership() {
        let f = fixture();
        let subscription = purchase(&f).await;
        let body = format!(
            r#"{{"id":"evt_3","type":"customer.subscription.deleted","data":{{"object":{{"id":"{subscription}"}}}}}}"#
        );
        let (payload, header) = signed(&body);

        f.processor.handle(&payload, Some(&header)).await.unwrap();
        let membership =
            f.storage.find_membership_by_subscription(&subscription).await.unwrap().unwrap();
        assert_eq!(membership.status, MembershipStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_not_reapplied() {
        let f = fixture();
        let subscription = purchase(&f).await;
        let body = format!(
            r#"{{"id":"evt_4","type":"invoice.paid","data":{{"object":{{"subscription":"{subscription}"}}}}}}"#
        );
        let (payload, header) = signed(&body);

        assert_eq!(f.processor.handle(&payload, Some(&header)).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(
            f.processor.handle(&payload, Some(&header)).await.unwrap(),
            WebhookOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_concurrent_redelivery_is_applied_once() {
        let f = fixture();
        let subscription = purchase(&f).await;
        let body = format!(
            r#"{{"id":"evt_8","type":"invoice.paid","data":{{"object":{{"subscription":"{subscription}"}}}}}}"#
        );
        let (payload, header) = signed(&body);

        let (first, second) = tokio::join!(
            f.processor.handle(&payload, Some(&header)),
            f.processor.handle(&payload, Some(&header)),
        );
        let mut outcomes = [first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|outcome| *outcome == WebhookOutcome::Duplicate);
        assert_eq!(outcomes, [WebhookOutcome::Applied, WebhookOutcome::Duplicate]);
    }

    #[tokio::test]
    async fn test_dedupe_survives_poisoned_lock() {
        let f = fixture();
        let subscription = purchase(&f).await;
        let body = format!(
            r#"{{"id":"evt_9","type":"invoice.paid","data":{{"object":{{"subscription":"{subscription}"}}}}}}"#
        );
        let (payload, header) = signed(&body);
        assert_eq!(f.processor.handle(&payload, Some(&header)).await.unwrap(), WebhookOutcome::Applied);

        let seen = &f.processor.seen;
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = seen.lock().unwrap();
            panic!("poison the dedupe lock");
        }));
        assert!(seen.is_poisoned());

        assert_eq!(
            f.processor.handle(&payload, Some(&header)).await.unwrap(),
            WebhookOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_released_event_can_be_claimed_again() {
        let f = fixture();
        assert!(f.processor.claim("evt_10"));
        f.processor.release("evt_10");
        assert!(f.processor.claim("evt_10"));
        assert!(!f.processor.claim("evt_10"));
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let f = fixture();
        let (payload, header) =
            signed(r#"{"id":"evt_5","type":"customer.created","data":{"object":{"id":"cus_1"}}}"#);
        assert_eq!(f.processor.handle(&payload, Some(&header)).await.unwrap(), WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_missing_signature_is_rejected() {
        let f = fixture();
        let result = f.processor.handle(b"{}", None).await;
        assert!(matches!(result, Err(PortalError::WebhookSignature(_))));
    }

    #[tokio::test]
    async fn test_missing_secret_is_internal() {
        let f = fixture();
        let processor = WebhookProcessor::new(f.service, None);
        let (payload, header) = signed(r#"{"id":"evt_6","type":"invoice.paid","data":{"object":{}}}"#);
        assert!(matches!(
            processor.handle(&payload, Some(&header)).await,
            Err(PortalError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_unmatched_subscription() {
        let f = fixture();
        let (payload, header) = signed(
            r#"{"id":"evt_7","type":"invoice.paid","data":{"object":{"subscription":"sub_nope"}}}"#,
        );
        assert_eq!(
            f.processor.handle(&payload, Some(&header)).await.unwrap(),
            WebhookOutcome::Unmatched
        );
        assert_eq!(f.storage.membership_count().await, 0);
    }
}
