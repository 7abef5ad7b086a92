//! HTTP request handlers for all API endpoints.
//!
//! One module per resource. Each handler:
//! - validates the request body and query
//! - checks permissions through [`crate::auth::permissions`]
//! - runs the business logic against the repositories in [`crate::db::handlers`]
//! - serializes a response type from [`crate::api::models`]
//!
//! # Authentication
//!
//! Handlers take [`crate::api::models::users::CurrentUser`] when a session is required, and
//! `Option<CurrentUser>` ([`crate::auth::current_user::MaybeUser`]) on the routes that also
//! serve guests: uploads, quotes, checkout, booking and design requests.
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`], which converts into a status code and a JSON body.

pub mod appointments;
pub mod auth;
pub mod credits;
pub mod dashboard;
pub mod design_requests;
pub mod materials;
pub mod orders;
pub mod payments;
pub mod pricing;
pub mod printers;
pub mod settings;
pub mod uploads;
pub mod users;

use crate::errors::Error;

/// Structural email check: one `@`, a non-empty local part and a dotted domain.
pub(crate) fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.trim().split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !email.trim().contains(char::is_whitespace)
}

/// The trimmed value, or `None` when absent or blank
pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

pub(crate) fn not_found(resource: &str, id: impl ToString) -> Error {
    Error::NotFound {
        resource: resource.to_string(),
        id: id.to_string(),
    }
}

/// 400 naming every missing field
pub(crate) fn missing_fields(fields: &[&str]) -> Error {
    Error::BadRequest {
        message: format!("Missing required fields: {}", fields.join(", ")),
    }
}
