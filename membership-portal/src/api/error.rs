//! Mapping from [`PortalError`] to HTTP responses.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::error::PortalError;

const INTERNAL_MESSAGE: &str = "Internal server error";

/// A [`PortalError`] on its way to the client as `{"message": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub PortalError);

impl ApiError {
    /// Status code for the wrapped error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PortalError::Validation(_)
            | PortalError::Gateway(_)
            | PortalError::WebhookSignature(_) => StatusCode::BAD_REQUEST,
            PortalError::PlanNotFound(_) | PortalError::NotFound(_) => StatusCode::NOT_FOUND,
            PortalError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            PortalError::Config(_) | PortalError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<PortalError> for ApiError {
    fn from(err: PortalError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(PortalError::Validation(format!("Invalid request body: {}", rejection.body_text())))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if self.0.is_internal() {
            error!(error = %self.0, "request failed");
            INTERNAL_MESSAGE.to_owned()
        } else {
            self.0.to_string()
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::GatewayError, models::PlanId};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (PortalError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (PortalError::Gateway(GatewayError::new("declined")), StatusCode::BAD_REQUEST),
            (PortalError::WebhookSignature("bad".into()), StatusCode::BAD_REQUEST),
            (PortalError::PlanNotFound(PlanId(9)), StatusCode::NOT_FOUND),
            (PortalError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (PortalError::RateLimitExceeded, StatusCode::TOO_MANY_REQUESTS),
            (PortalError::Config("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (PortalError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[tokio::test]
    async fn test_internal_detail_is_hidden() {
        use http_body_util::BodyExt;

        let response = ApiError(PortalError::Internal("db password is hunter2".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "message": INTERNAL_MESSAGE }));
    }
}
