use axum::{Json, response::IntoResponse, response::Response};
use serde::Serialize;
use serde_json::json;
use temanjalan_domain::error::DomainError;

use crate::error::ApiError;

/// `{"success":true,"data":{...}}` — the only success shape on the wire.
pub fn success<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// Business rejection: HTTP 200 with a machine-readable code. Polling
/// clients treat these as "continue", never as a failure to abort on.
pub fn business_rejection(code: &'static str, message: String) -> Response {
    Json(json!({ "success": false, "code": code, "message": message })).into_response()
}

/// Split a domain result into the three wire channels: success data,
/// business rejection, or transport error.
pub fn respond<T: Serialize>(result: Result<T, DomainError>) -> Result<Response, ApiError> {
    match result {
        Ok(data) => Ok(success(data)),
        Err(DomainError::Rejected { code, message }) => Ok(business_rejection(code, message)),
        Err(err) => Err(map_domain_error(err)),
    }
}

pub fn map_domain_error(err: DomainError) -> ApiError {
    match err {
        DomainError::Validation(message) => ApiError::Validation(message),
        DomainError::Forbidden => ApiError::Forbidden,
        DomainError::NotFound => ApiError::NotFound,
        DomainError::Conflict => ApiError::Conflict,
        DomainError::Rejected { message, .. } => ApiError::Validation(message),
        DomainError::Store(message) => {
            tracing::error!(error = %message, "unexpected store failure");
            ApiError::Internal
        }
    }
}
