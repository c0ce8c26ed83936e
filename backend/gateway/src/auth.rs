//! Bearer token extraction.
//!
//! The gateway does not validate tokens; it forwards them to the plugin that
//! serves the invoked capability.

use std::convert::Infallible;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// `Authorization: Bearer <token>`, if present and well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub Option<String>);

impl BearerToken {
    pub fn parse(header: &str) -> Option<String> {
        let token = header.strip_prefix("Bearer ")?.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|val| val.to_str().ok())
            .and_then(BearerToken::parse);
        Ok(BearerToken(token))
    }
}
