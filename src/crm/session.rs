//! Request-scoped account context.
//!
//! The signed-in account arrives with each request as headers set by the
//! auth proxy in front of this service, and is handed to handlers as an
//! ordinary extractor argument.

use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::api::ApiError;
use super::models::{Account, AccountId, Role};

pub const ACCOUNT_HEADER: &str = "x-account-id";
pub const ROLE_HEADER: &str = "x-account-role";

fn header_value<'a>(parts: &'a Parts, name: &str) -> Result<Option<&'a str>, ApiError> {
    match parts.headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()))
            .map_err(|_| ApiError::BadRequest(format!("Header {} is not valid text", name))),
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Account {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_value(parts, ACCOUNT_HEADER)?
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", ACCOUNT_HEADER)))?;
        let role = match header_value(parts, ROLE_HEADER)? {
            Some(raw) if !raw.is_empty() => Role::from_str(raw).map_err(ApiError::BadRequest)?,
            _ => Role::default(),
        };
        Ok(Account::new(AccountId::from(id), role))
    }
}
