//! Current-user identity as asserted by the upstream session layer.
//!
//! Session mechanics live outside the gateway; we only read a trusted header.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-id";

/// The authenticated user for this request, stored in request extensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser(pub String);

impl AuthenticatedUser {
    pub fn id(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    header: HeaderName,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
        }
    }
}

impl IdentityConfig {
    pub fn new(header: &str) -> Result<Self, Error> {
        let header = HeaderName::try_from(header.to_ascii_lowercase()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid identity header `{header}`: {e}"),
            })
        })?;
        Ok(Self { header })
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    pub fn extract(&self, headers: &HeaderMap) -> Option<AuthenticatedUser> {
        headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| AuthenticatedUser(id.to_string()))
    }
}

/// Rejects requests without an identity with 401, before any governance runs
pub async fn require_user(
    State(config): State<IdentityConfig>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = match request.extensions().get::<AuthenticatedUser>() {
        Some(user) => Some(user.clone()),
        None => config.extract(request.headers()),
    };
    match user {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => Error::new(ErrorDetails::MissingIdentity).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_trims_header() {
        let config = IdentityConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("  user-42 "));
        assert_eq!(
            config.extract(&headers),
            Some(AuthenticatedUser("user-42".to_string()))
        );
    }

    #[test]
    fn test_blank_header_is_no_identity() {
        let config = IdentityConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("   "));
        assert_eq!(config.extract(&headers), None);
    }

    #[test]
    fn test_custom_header_name() {
        let config = IdentityConfig::new("X-Authenticated-User").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-authenticated-user", HeaderValue::from_static("abc"));
        assert_eq!(config.extract(&headers).unwrap().id(), "abc");
    }

    #[test]
    fn test_invalid_header_name_is_config_error() {
        assert!(IdentityConfig::new("not a header").is_err());
    }
}
