use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use payrail_store::StoreError;
use serde_json::json;

/// Unified error type for the traffic-control core.
///
/// Store failures are normally downgraded to fail-open defaults inside the
/// rate limiter and cache and never reach a client; the variants here are the
/// ones an outer HTTP layer maps to responses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no request context bound to the current task")]
    ContextAbsent,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_ms: i64,
        retry_after_secs: u64,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache lock contended: {0}")]
    LockUnobtainable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable(_) | Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ContextAbsent | Self::LockUnobtainable(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Authentication(_) => "authentication_error",
            Self::Authorization(_) => "authorization_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::NotFound(_) | Self::BadRequest(_) => "invalid_request_error",
            Self::StoreUnavailable(_) | Self::Database(_) => "service_unavailable",
            _ => "server_error",
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Self::Authentication(_) => "invalid_api_key",
            Self::Authorization(_) => "tenant_inactive",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::NotFound(_) => "resource_not_found",
            Self::BadRequest(_) => "invalid_request",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Database(_) => "database_unavailable",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.error_code(),
            }
        });

        let mut response = (
            status,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response();

        if let Self::RateLimited {
            limit,
            remaining,
            reset_ms,
            retry_after_secs,
        } = self
        {
            let headers = response.headers_mut();
            if let Ok(v) = limit.to_string().parse() {
                headers.insert("x-ratelimit-limit", v);
            }
            if let Ok(v) = remaining.to_string().parse() {
                headers.insert("x-ratelimit-remaining", v);
            }
            if let Ok(v) = reset_ms.to_string().parse() {
                headers.insert("x-ratelimit-reset", v);
            }
            if let Ok(v) = retry_after_secs.to_string().parse() {
                headers.insert("retry-after", v);
            }
        }

        response
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::Authentication("bad key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::Authorization("inactive".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::RateLimited {
                limit: 10,
                remaining: 0,
                reset_ms: 0,
                retry_after_secs: 1,
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::StoreUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_rate_limited_response_headers() {
        let response = Error::RateLimited {
            limit: 100,
            remaining: 0,
            reset_ms: 3_600_000,
            retry_after_secs: 42,
        }
        .into_response();

        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("retry-after").unwrap(), "42");
    }
}
