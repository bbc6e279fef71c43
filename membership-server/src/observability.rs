//! Logging setup and the `/health` report.
//!
//! Request spans come from the router's trace layer; this module only
//! installs the subscriber and decides what the health document says about
//! storage, the billing gateway and webhook signing.

use std::io;

use membership_portal::PortalError;
use serde::Serialize;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Subscriber output selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines on stderr.
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`; anything other than `json` means pretty.
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` filters events and defaults to `info`. Span close events are
/// emitted so request timings show up without extra instrumentation.
///
/// # Examples
///
/// ```no_run
/// init_observability(LogFormat::from_env());
/// tracing::info!("logging ready");
/// ```
pub fn init_observability(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => {
            subscriber
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Json => {
            subscriber
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init();
        }
    }
}

/// Overall state reported by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Serving, but a check warned.
    Degraded,
    /// A check failed; the endpoint answers 503.
    Unhealthy,
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckStatus {
    /// Check passed.
    Pass,
    /// Check failed.
    Fail,
    /// Degraded but operational.
    Warn,
}

/// One named entry in the health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: &'static str,
    /// Check status.
    pub status: HealthCheckStatus,
    /// Detail shown to operators.
    pub message: String,
}

impl HealthCheck {
    fn new(name: &'static str, status: HealthCheckStatus, message: impl Into<String>) -> Self {
        Self { name, status, message: message.into() }
    }
}

/// Builds the storage, gateway and webhook checks.
///
/// `plans` is the outcome of listing the catalog. An empty catalog fails the
/// storage check since no purchase could succeed. A missing webhook secret
/// only warns: payments still work but provider events are rejected.
#[must_use]
pub fn portal_checks(
    plans: Result<usize, PortalError>,
    gateway: &str,
    webhook_configured: bool,
) -> Vec<HealthCheck> {
    let storage = match plans {
        Ok(0) => HealthCheck::new("storage", HealthCheckStatus::Fail, "catalog is empty"),
        Ok(count) => HealthCheck::new("storage", HealthCheckStatus::Pass, format!("{count} plans loaded")),
        Err(err) => HealthCheck::new("storage", HealthCheckStatus::Fail, err.to_string()),
    };
    let webhook = if webhook_configured {
        HealthCheck::new("webhook_secret", HealthCheckStatus::Pass, "configured")
    } else {
        HealthCheck::new("webhook_secret", HealthCheckStatus::Warn, "webhook secret is not configured")
    };
    vec![storage, HealthCheck::new("gateway", HealthCheckStatus::Pass, gateway), webhook]
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status among the checks.
    pub status: HealthStatus,
    /// Server version.
    pub version: String,
    /// Service name.
    pub service: String,
    /// Active billing gateway.
    pub gateway: String,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Individual checks.
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Pretty-printed JSON body.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Any failure makes the report unhealthy; otherwise any warning degrades it.
    #[must_use]
    pub fn compute_status(checks: &[HealthCheck]) -> HealthStatus {
        if checks.iter().any(|c| c.status == HealthCheckStatus::Fail) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthCheckStatus::Warn) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
