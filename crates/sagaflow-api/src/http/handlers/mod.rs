//! HTTP request handlers for the REST API.

pub mod action;
pub mod definition;
pub mod event;
pub mod instance;

use crate::http::error::AppError;

/// Parse a path segment as a UUID, reporting the resource kind on failure.
pub(crate) fn parse_id(raw: &str, kind: &str) -> Result<uuid::Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::Validation(format!("invalid {kind} id '{raw}'")))
}
