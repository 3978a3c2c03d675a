use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::fleet::FleetError;

/// RFC 7807 problem document.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fleet.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retryable(&mut self, retryable: bool) {
        self.retryable = retryable;
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn gone(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::GONE, code, message)
    }

    pub fn unprocessable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNPROCESSABLE_ENTITY, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.set_retryable(true);
        err
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let code = err.code();
        match &err {
            FleetError::NotFound(_) => ApiError::not_found(code, err.to_string()),
            FleetError::NodeExpired(_) => ApiError::gone(code, err.to_string()),
            FleetError::NotReady { retry_after, .. } => {
                let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u32;
                ApiError::conflict(code, err.to_string()).with_retry_after_seconds(seconds)
            }
            FleetError::Integrity(_) => ApiError::unprocessable(code, err.to_string()),
            FleetError::InvalidArgument(_) => ApiError::bad_request(code, err.to_string()),
            FleetError::PermissionDenied(_) => ApiError::forbidden(code, err.to_string()),
            // Store internals stay out of the response body.
            FleetError::Unavailable(_) => {
                ApiError::service_unavailable(code, "The coordinator store is unavailable")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreError;
    use fleet_id::{NodeId, ObjectId};
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(FleetError::NotFound("run 7".into()), 404, "not_found", false)]
    #[case(FleetError::NodeExpired(NodeId::new(9).unwrap()), 410, "node_expired", false)]
    #[case(FleetError::Integrity("digest".into()), 422, "integrity_error", false)]
    #[case(FleetError::InvalidArgument("bad".into()), 400, "invalid_argument", false)]
    #[case(FleetError::PermissionDenied("finished".into()), 403, "permission_denied", false)]
    #[case(FleetError::Unavailable(StoreError::LockPoisoned), 503, "unavailable", true)]
    fn test_fleet_error_mapping(
        #[case] err: FleetError,
        #[case] status: u16,
        #[case] code: &str,
        #[case] retryable: bool,
    ) {
        let api = ApiError::from(err);
        assert_eq!(api.status.as_u16(), status);
        assert_eq!(api.problem.code, code);
        assert_eq!(api.problem.retryable, retryable);
    }

    #[test]
    fn test_not_ready_carries_retry_hint() {
        let api = ApiError::from(FleetError::NotReady {
            object_id: ObjectId::from_content(b"x"),
            retry_after: Duration::from_millis(1500),
        })
        .with_request_id("req-1");
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert!(api.problem.retryable);
        assert_eq!(api.problem.retry_after_seconds, 2);
        assert_eq!(api.problem.request_id, "req-1");
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::not_found("not_found", "gone").into_response();
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
