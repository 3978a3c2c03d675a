//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use fleet_id::RequestId;

use crate::api::error::ApiError;
use crate::fleet::FleetError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Bearer token, if any. Never log it.
    bearer_token: Option<String>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

impl RequestContext {
    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// Converts a coordinator error into a problem response for this request.
    pub fn fail(&self, err: FleetError) -> ApiError {
        match &err {
            FleetError::Unavailable(e) => {
                tracing::error!(request_id = %self.request_id, error = %e, "Store failure");
            }
            other => {
                tracing::debug!(request_id = %self.request_id, code = other.code(), error = %other, "Request failed");
            }
        }
        ApiError::from(err).with_request_id(self.request_id.clone())
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .unwrap_or_else(|| RequestId::new().to_string());

        let bearer_token = match header_string(&parts.headers, AUTHORIZATION_HEADER) {
            None => None,
            Some(value) => {
                let Some(token) = value.trim().strip_prefix("Bearer ") else {
                    return Err(ApiError::unauthorized(
                        "invalid_authorization",
                        "Authorization must be a Bearer token",
                    )
                    .with_request_id(request_id));
                };
                Some(token.trim().to_string())
            }
        };

        Ok(Self {
            request_id,
            bearer_token,
        })
    }
}
