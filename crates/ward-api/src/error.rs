use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use ward_core::store::route;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unreadable body: {0}")]
    Body(#[from] JsonRejection),
    #[error(transparent)]
    Store(#[from] ward_core::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    details: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                let body = ErrorBody {
                    error: "invalid_request".to_string(),
                    details: message,
                };
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            Self::Body(rejection) => {
                let body = ErrorBody {
                    error: "invalid_body".to_string(),
                    details: rejection.body_text(),
                };
                (rejection.status(), Json(body)).into_response()
            }
            Self::Store(error) => {
                let status = StatusCode::from_u16(route::error_status(&error))
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!("Store failure: {error}");
                }
                (status, Json(route::error_body(&error))).into_response()
            }
        }
    }
}
