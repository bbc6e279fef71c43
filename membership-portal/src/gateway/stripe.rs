//! Stripe REST client.
//!
//! Requests are form-encoded with bearer auth. Error bodies of the form
//! `{"error":{"message":"..."}}` are surfaced as the [`GatewayError`]
//! message; anything else becomes a generic status message.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, instrument};
use url::Url;
use zeroize::Zeroizing;

use super::{
    BillingGateway, CustomerRef, OneOffCharge, OneOffChargeRequest, RecurringCharge,
    RecurringChargeRequest,
};
use crate::error::{GatewayError, PortalError, Result};

/// Connection settings for [`StripeGateway`].
///
/// ```toml
/// [gateway.stripe]
/// api_base = "https://api.stripe.com"
/// timeout_secs = 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StripeConfig {
    /// API root, without the `/v1` suffix.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Total request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl StripeConfig {
    /// Checks timeouts and that `api_base` is an HTTPS URL.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.timeout_secs > 300 {
            return Err(PortalError::Config(
                "gateway.stripe.timeout_secs must be between 1 and 300".to_owned(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.connect_timeout_secs > 60 {
            return Err(PortalError::Config(
                "gateway.stripe.connect_timeout_secs must be between 1 and 60".to_owned(),
            ));
        }
        let url = Url::parse(&self.api_base)
            .map_err(|e| PortalError::Config(format!("gateway.stripe.api_base: {e}")))?;
        if url.scheme() != "https" {
            return Err(PortalError::Config("gateway.stripe.api_base must use https".to_owned()));
        }
        Ok(())
    }
}

fn default_api_base() -> String {
    "https://api.stripe.com".to_owned()
}

const fn default_timeout_secs() -> u64 {
    20
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
struct CustomerList {
    data: Vec<IdOnly>,
}

#[derive(Deserialize)]
struct Subscription {
    id: String,
    status: String,
    latest_invoice: Option<Invoice>,
}

#[derive(Deserialize)]
struct Invoice {
    payment_intent: Option<PaymentIntent>,
}

#[derive(Deserialize)]
struct PaymentIntent {
    id: String,
    client_secret: Option<String>,
}

/// [`BillingGateway`] backed by the Stripe REST API.
pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: Zeroizing<String>,
}

impl fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeGateway")
            .field("api_base", &self.api_base)
            .field("secret_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl StripeGateway {
    /// Builds a client for `config` authenticating with `secret_key`.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] if the config is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: &StripeConfig, secret_key: Zeroizing<String>) -> Result<Self> {
        config.validate()?;
        if secret_key.trim().is_empty() {
            return Err(PortalError::Config("stripe secret key is empty".to_owned()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| PortalError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            secret_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.api_base)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(self.secret_key.as_str())
    }

    fn post(&self, path: &str, form: &[(String, String)]) -> RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(self.secret_key.as_str()).form(form)
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, GatewayError> {
        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|envelope| envelope.error.message)
                .unwrap_or_else(|| format!("billing provider returned status {}", status.as_u16()));
            return Err(GatewayError::new(message));
        }

        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::new(format!("unexpected billing provider response: {e}")))
    }
}

fn field(key: &str, value: impl ToString) -> (String, String) {
    (key.to_owned(), value.to_string())
}

#[async_trait]
impl BillingGateway for StripeGateway {
    #[instrument(skip(self, email, name), level = "debug")]
    async fn find_or_create_customer(
        &self,
        email: &str,
        name: &str,
    ) -> Result<CustomerRef, GatewayError> {
        let existing: CustomerList =
            Self::send(self.get("customers").query(&[("email", email), ("limit", "1")])).await?;
        if let Some(customer) = existing.data.into_iter().next() {
            debug!(customer_id = %customer.id, "reusing customer");
            return Ok(CustomerRef { id: customer.id });
        }

        let created: IdOnly =
            Self::send(self.post("customers", &[field("email", email), field("name", name)]))
                .await?;
        debug!(customer_id = %created.id, "customer created");
        Ok(CustomerRef { id: created.id })
    }

    #[instrument(
        skip(self, request),
        fields(customer = %request.customer.id, amount_minor = request.amount_minor),
        level = "debug"
    )]
    async fn create_recurring_charge(
        &self,
        request: RecurringChargeRequest,
    ) -> Result<RecurringCharge, GatewayError> {
        let product: IdOnly = Self::send(self.post("products", &[
            field("name", &request.plan_name),
            field("description", &request.plan_description),
        ]))
        .await?;

        let price: IdOnly = Self::send(self.post("prices", &[
            field("product", &product.id),
            field("unit_amount", request.amount_minor),
            field("currency", &request.currency),
            field("recurring[interval]", request.interval.as_str()),
        ]))
        .await?;

        let subscription: Subscription = Self::send(self.post("subscriptions", &[
            field("customer", &request.customer.id),
            field("items[0][price]", &price.id),
            field("payment_behavior", "default_incomplete"),
            field("payment_settings[save_default_payment_method]", "on_subscription"),
            field("expand[]", "latest_invoice.payment_intent"),
        ]))
        .await?;

        let client_secret = subscription
            .latest_invoice
            .and_then(|invoice| invoice.payment_intent)
            .and_then(|intent| intent.client_secret);

        Ok(RecurringCharge {
            subscription_id: subscription.id,
            client_secret,
            status: subscription.status,
        })
    }

    #[instrument(skip(self, request), fields(amount_minor = request.amount_minor), level = "debug")]
    async fn create_one_off_charge(
        &self,
        request: OneOffChargeRequest,
    ) -> Result<OneOffCharge, GatewayError> {
        if request.amount_minor <= 0 {
            return Err(GatewayError::new("charge amount must be positive"));
        }

        let mut form = vec![
            field("amount", request.amount_minor),
            field("currency", &request.currency),
            field("automatic_payment_methods[enabled]", "true"),
        ];
        form.extend(request.metadata.iter().map(|(k, v)| field(&format!("metadata[{k}]"), v)));

        let intent: PaymentIntent = Self::send(self.post("payment_intents", &form)).await?;
        Ok(OneOffCharge { payment_intent_id: intent.id, client_secret: intent.client_secret })
    }

    fn name(&self) -> &'static str {
        "stripe"
    }
}
