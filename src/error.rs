use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct ServiceError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { error: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            error: message.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

/// Anything that is not an explicit early return ends up as a 500 carrying the error message.
impl<E> From<E> for ServiceError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ServiceError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: HttpErrorResponse::from(err.into().to_string()),
        }
    }
}

pub type ServiceResult<T, E = ServiceError> = Result<T, E>;

/// Multipart errors carry their own status, e.g. 413 once the body limit is hit.
pub fn multipart_error(err: MultipartError) -> ServiceError {
    ServiceError {
        status: err.status(),
        message: HttpErrorResponse::from(err.body_text()),
    }
}

#[macro_export]
macro_rules! bail_service {
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::ServiceError {
            status: $status_code,
            message: $crate::error::HttpErrorResponse::from($error_message),
        })
    };
}
