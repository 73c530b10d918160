//! Caller identity resolution for rate-limit and quota accounting.
//!
//! An inbound request is keyed by the strongest identity available:
//! authenticated user id, then API key, then source IP. Identities are
//! normalized upstream by the auth layer; the gateway trusts the headers.

use axum::async_trait;
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;

/// Resolved caller identity used as the accounting key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    ApiKey(String),
    Ip(String),
    Unknown,
}

impl Identity {
    /// Resolve identity from request headers with precedence
    /// user id > API key > client IP > unknown
    pub fn from_request(request: &Request) -> Self {
        Self::resolve(request.headers(), request.extensions())
    }

    pub fn resolve(headers: &HeaderMap, extensions: &Extensions) -> Self {
        if let Some(user_id) = header_str(headers, "x-user-id") {
            return Identity::User(user_id);
        }
        if let Some(api_key) = header_str(headers, "x-api-key") {
            return Identity::ApiKey(api_key);
        }
        match client_ip(headers, extensions) {
            Some(ip) => Identity::Ip(ip),
            None => Identity::Unknown,
        }
    }

    /// Stable string key for store lookups and log fields
    pub fn key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{}", id),
            Identity::ApiKey(key) => format!("apikey:{}", key),
            Identity::Ip(addr) => format!("ip:{}", addr),
            Identity::Unknown => "unknown".to_string(),
        }
    }

    /// Authenticated callers get the higher per-minute ceiling
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::User(_) | Identity::ApiKey(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Identity::resolve(&parts.headers, &parts.extensions))
    }
}

/// Subscription tier controlling the daily message ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Plus,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Plus => "plus",
            Tier::Pro => "pro",
        }
    }

    /// Parse a tier claim, defaulting to free on anything unrecognized
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "plus" => Tier::Plus,
            "pro" => Tier::Pro,
            _ => Tier::Free,
        }
    }

    /// Resolve the effective tier for a caller. Anonymous identities are
    /// coerced to free regardless of any claimed tier.
    pub fn for_identity(identity: &Identity, claimed: Option<&str>) -> Self {
        if !identity.is_authenticated() {
            return Tier::Free;
        }
        claimed.map(Tier::parse).unwrap_or(Tier::Free)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Extract the client IP, preferring proxy headers over the socket address
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return Some(first_ip.to_string());
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return Some(ip_str.to_string());
        }
    }

    extensions
        .get::<SocketAddr>()
        .map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    fn request_with_headers(headers: &[(&str, &str)]) -> Request {
        let mut request = Request::new(Body::empty());
        for (name, value) in headers {
            request.headers_mut().insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        request
    }

    #[test]
    fn test_user_id_takes_precedence() {
        let request = request_with_headers(&[
            ("x-user-id", "alice"),
            ("x-api-key", "key-1"),
            ("x-forwarded-for", "192.168.1.1"),
        ]);
        let identity = Identity::from_request(&request);
        assert_eq!(identity, Identity::User("alice".to_string()));
        assert_eq!(identity.key(), "user:alice");
        assert!(identity.is_authenticated());
    }

    #[test]
    fn test_api_key_over_ip() {
        let request = request_with_headers(&[
            ("x-api-key", "key-1"),
            ("x-forwarded-for", "192.168.1.1"),
        ]);
        let identity = Identity::from_request(&request);
        assert_eq!(identity.key(), "apikey:key-1");
    }

    #[test]
    fn test_ip_fallback_from_forwarded_header() {
        let request =
            request_with_headers(&[("x-forwarded-for", "192.168.1.1, 10.0.0.1")]);
        let identity = Identity::from_request(&request);
        assert_eq!(identity.key(), "ip:192.168.1.1");
        assert!(!identity.is_authenticated());
    }

    #[test]
    fn test_unknown_when_nothing_present() {
        let request = request_with_headers(&[]);
        assert_eq!(Identity::from_request(&request), Identity::Unknown);
        assert_eq!(Identity::Unknown.key(), "unknown");
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!(Tier::parse("pro"), Tier::Pro);
        assert_eq!(Tier::parse("Plus"), Tier::Plus);
        assert_eq!(Tier::parse("enterprise"), Tier::Free);
    }

    #[test]
    fn test_anonymous_coerced_to_free() {
        let anon = Identity::Ip("10.0.0.1".to_string());
        assert_eq!(Tier::for_identity(&anon, Some("pro")), Tier::Free);

        let user = Identity::User("alice".to_string());
        assert_eq!(Tier::for_identity(&user, Some("pro")), Tier::Pro);
        assert_eq!(Tier::for_identity(&user, None), Tier::Free);
    }
}
