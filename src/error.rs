use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::query::guard::QueryGuardError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    QueryRejected(#[from] QueryGuardError),

    #[error("operation timed out")]
    Timeout,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable code carried in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Unauthenticated => "Unauthenticated",
            Self::Forbidden => "Forbidden",
            Self::BadRequest(_) => "BadRequest",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::QueryRejected(e) => e.code(),
            Self::Timeout => "Timeout",
            Self::Unavailable(_) => "Unavailable",
            Self::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) | Self::QueryRejected(_) => StatusCode::BAD_REQUEST,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                "internal server error".to_owned()
            }
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "error": { "code": self.code(), "message": message }
        });
        (self.status(), axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".into()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::AlreadyExists("resource already exists".into())
            }
            _ => {
                tracing::error!(error = %err, "database error");
                Self::Internal(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::Unauthenticated.code(), "Unauthenticated");
        assert_eq!(ApiError::Forbidden.code(), "Forbidden");
        assert_eq!(ApiError::NotFound("x".into()).code(), "NotFound");
        assert_eq!(
            ApiError::QueryRejected(QueryGuardError::MissingWhere).code(),
            "MissingWhere"
        );
    }

    #[test]
    fn guard_error_maps_to_bad_request() {
        let err = ApiError::QueryRejected(QueryGuardError::DangerousOperation("DROP".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "DangerousOperation");
    }
}
