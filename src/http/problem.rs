//! Problem Responses
//!
//! Every failure leaves as `application/problem+json` with a stable `code`.
//! Internal failures are logged here and reach the client as a bare
//! `internal_error`.

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error};

use crate::concurrency::Version;
use crate::error::{AccountError, AuthError, AuthzError, ConcurrencyError, ValidationError};
use crate::store::StoreError;

/// Media type of error bodies.
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, Serialize)]
struct ProblemBody {
    #[serde(rename = "type")]
    kind: String,
    title: &'static str,
    status: u16,
    code: &'static str,
}

/// An HTTP failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    title: &'static str,
    /// Current entity version, for 412 responses.
    etag: Option<Version>,
}

impl ApiError {
    /// A problem with a machine-readable `code` and a human `title`.
    pub fn new(status: StatusCode, code: &'static str, title: &'static str) -> Self {
        Self {
            status,
            code,
            title,
            etag: None,
        }
    }

    /// Attach the current version as an `ETag` header.
    pub fn with_etag(mut self, version: Version) -> Self {
        self.etag = Some(version);
        self
    }

    /// Log `err` and hide it behind a 500.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }

    /// 401 for a missing or bad bearer token.
    pub fn invalid_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid_token", "Invalid access token")
    }

    /// HTTP status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProblemBody {
            kind: format!("urn:geoquest:problem:{}", self.code),
            title: self.title,
            status: self.status.as_u16(),
            code: self.code,
        };
        let mut response = (self.status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        if let Some(version) = self.etag {
            if let Ok(value) = HeaderValue::from_str(&version.to_etag()) {
                headers.insert(header::ETAG, value);
            }
        }
        response
    }
}

// =============================================================================
// CONVERSIONS
// =============================================================================

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::internal(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, err.code(), "Invalid request")
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Signing(_) | AuthError::Store(_) => ApiError::internal(err),
            other => ApiError::new(
                StatusCode::UNAUTHORIZED,
                other.refresh_code(),
                "Refresh token rejected",
            ),
        }
    }
}

impl From<AuthzError> for ApiError {
    fn from(err: AuthzError) -> Self {
        let code = err.code();
        let (status, title) = match err {
            AuthzError::Unauthenticated => return ApiError::invalid_token(),
            AuthzError::Store(e) => return ApiError::internal(e),
            AuthzError::RoomIdMissing => (StatusCode::BAD_REQUEST, "Room id missing"),
            AuthzError::NotMember => (StatusCode::FORBIDDEN, "Not a member of this room"),
            AuthzError::Banned => (StatusCode::FORBIDDEN, "Banned from this room"),
            AuthzError::MissingPermission | AuthzError::MissingRole => {
                (StatusCode::FORBIDDEN, "Missing permission")
            }
        };
        ApiError::new(status, code, title)
    }
}

impl From<ConcurrencyError> for ApiError {
    fn from(err: ConcurrencyError) -> Self {
        match err {
            ConcurrencyError::PreconditionRequired => ApiError::new(
                StatusCode::PRECONDITION_REQUIRED,
                "precondition_required",
                "If-Match header required",
            ),
            ConcurrencyError::MalformedPrecondition => ApiError::new(
                StatusCode::BAD_REQUEST,
                "malformed_precondition",
                "If-Match header is malformed",
            ),
            ConcurrencyError::PreconditionFailed { current } => ApiError::new(
                StatusCode::PRECONDITION_FAILED,
                "precondition_failed",
                "Resource was modified",
            )
            .with_etag(current),
            ConcurrencyError::Conflict { field: "email" } => {
                ApiError::new(StatusCode::CONFLICT, "email_taken", "Email already in use")
            }
            ConcurrencyError::Conflict { .. } => {
                ApiError::new(StatusCode::CONFLICT, "conflict", "Conflicting value")
            }
        }
    }
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::Validation(e) => e.into(),
            AccountError::UserExists => {
                ApiError::new(StatusCode::CONFLICT, "user_exists", "User already exists")
            }
            AccountError::UserNotFound => {
                ApiError::new(StatusCode::NOT_FOUND, "user_not_found", "User not found")
            }
            AccountError::Auth(e) => e.into(),
            AccountError::Concurrency(e) => e.into(),
            AccountError::Store(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(reason = %rejection.body_text(), "request body rejected");
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_body", "Malformed request body")
    }
}
