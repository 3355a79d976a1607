use serde::Serialize;
use thiserror::Error;

/// Stable error taxonomy returned to both node agents and operator clients.
/// `kind` maps onto the transport-level status (HTTP code or WS error frame).
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("target offline: {0}")]
    Offline(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("rejected by node: {0}")]
    Rejected(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limited")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Conflict,
    Offline,
    Timeout,
    Rejected,
    Unauthorized,
    Forbidden,
    RateLimited,
    Internal,
}

impl RouteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouteError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RouteError::NotFound(_) => ErrorKind::NotFound,
            RouteError::Conflict(_) => ErrorKind::Conflict,
            RouteError::Offline(_) => ErrorKind::Offline,
            RouteError::Timeout(_) => ErrorKind::Timeout,
            RouteError::Rejected(_) => ErrorKind::Rejected,
            RouteError::Unauthorized => ErrorKind::Unauthorized,
            RouteError::Forbidden(_) => ErrorKind::Forbidden,
            RouteError::RateLimited => ErrorKind::RateLimited,
            RouteError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.kind() {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Offline => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl axum::response::IntoResponse for RouteError {
    fn into_response(self) -> axum::response::Response {
        let status = self.http_status();
        let body = ErrorBody { kind: self.kind(), message: self.to_string() };
        (status, axum::Json(body)).into_response()
    }
}
