//! Mapping of domain errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use super::html::{esc, page};
use crate::error::AppError;

/// Error returned by page handlers, rendered as an HTML error page.
#[derive(Debug)]
pub struct WebError {
    pub status: StatusCode,
    pub title: &'static str,
    pub detail: String,
}

impl WebError {
    pub fn new(status: StatusCode, title: &'static str, detail: impl Into<String>) -> Self {
        WebError {
            status,
            title,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found", detail)
    }
}

impl From<AppError> for WebError {
    fn from(err: AppError) -> Self {
        let (status, title) = match &err {
            AppError::InvalidTransition { .. } => (StatusCode::CONFLICT, "Not Allowed"),
            AppError::PrerequisiteNotMet(_) => (StatusCode::CONFLICT, "Not Ready"),
            AppError::Unauthorized(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "Invalid Input"),
            AppError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "Sign In Failed"),
            AppError::Database(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Server Error")
            }
        };

        let detail = if err.is_user_facing() {
            warn!(status = status.as_u16(), error = %err, "request rejected");
            err.to_string()
        } else {
            error!(error = %err, "request failed");
            "Something went wrong. The error has been logged.".to_string()
        };
        WebError::new(status, title, detail)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let body = format!(
            r#"<div class="alert error">{}</div>
<p><a href="javascript:history.back()">Go back</a> or return to the <a href="/">dashboard</a>.</p>"#,
            esc(&self.detail)
        );
        (self.status, page(self.title, None, &body)).into_response()
    }
}

pub type PageResult<T> = Result<T, WebError>;
