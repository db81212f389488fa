//! Client authentication
//!
//! Clients authenticate with `Proxy-Authorization: Basic <token>`. The token
//! is the credential string as sent, compared against the project token.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHORIZATION};
use tracing::warn;

use crate::error::{Result, RotorError};

pub struct ClientAuth;

impl ClientAuth {
    /// Extract the project token from the request headers
    pub fn token(headers: &HeaderMap) -> Result<String> {
        let auth_header = headers
            .get(PROXY_AUTHORIZATION)
            .ok_or(RotorError::MissingToken)?;

        let auth_str = auth_header
            .to_str()
            .map_err(|_| RotorError::MissingToken)?;

        // Parse "Basic <token>"
        let token = match auth_str.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("basic") => token.trim(),
            _ => {
                warn!("Invalid auth scheme, expected Basic");
                return Err(RotorError::MissingToken);
            }
        };

        if token.is_empty() {
            return Err(RotorError::MissingToken);
        }

        Ok(token.to_string())
    }

    /// Token a client sends for `username:password`
    pub fn encode(username: &str, password: &str) -> String {
        BASE64.encode(format!("{}:{}", username, password))
    }

    /// `Proxy-Authorization` value carrying `token`
    pub fn header_value(token: &str) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|_| RotorError::InvalidRequest("Invalid token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(auth_value) = auth {
            headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(auth_value).unwrap());
        }
        headers
    }

    #[test]
    fn test_auth_missing_header() {
        assert!(matches!(
            ClientAuth::token(&headers_with_auth(None)),
            Err(RotorError::MissingToken)
        ));
    }

    #[test]
    fn test_auth_valid_token() {
        let token = ClientAuth::encode("user", "pass");
        let headers = headers_with_auth(Some(&format!("Basic {}", token)));
        assert_eq!(ClientAuth::token(&headers).unwrap(), token);

        let headers = headers_with_auth(Some("basic abc"));
        assert_eq!(ClientAuth::token(&headers).unwrap(), "abc");
    }

    #[test]
    fn test_auth_invalid_scheme() {
        assert!(matches!(
            ClientAuth::token(&headers_with_auth(Some("Bearer token123"))),
            Err(RotorError::MissingToken)
        ));
        assert!(matches!(
            ClientAuth::token(&headers_with_auth(Some("Basic "))),
            Err(RotorError::MissingToken)
        ));
    }

    #[test]
    fn test_header_value_round_trip() {
        let value = ClientAuth::header_value("dG9rZW4=").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHORIZATION, value);
        assert_eq!(ClientAuth::token(&headers).unwrap(), "dG9rZW4=");
    }
}
