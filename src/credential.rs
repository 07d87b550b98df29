//! Shared-secret check for the reindex operation.
//!
//! The credential may arrive in the `X-REINDEX-SECRET` header, as a bearer
//! token, or as a `secret` field in the JSON body, checked in that order.

use axum::http::{header, HeaderMap};

pub const SECRET_HEADER: &str = "x-reindex-secret";

/// Compares a provided secret against the expected one in constant time.
///
/// The loop always runs over the longer of the two inputs, so timing does not
/// depend on where the inputs differ or on the provided length.
///
/// Returns `false` if either secret is empty.
pub fn validate_secret(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    if provided.is_empty() || expected.is_empty() {
        return false;
    }

    let len = provided.len().max(expected.len());
    let mut diff = (provided.len() ^ expected.len()) as u64;
    for i in 0..len {
        let a = provided.get(i).copied().unwrap_or(0);
        let b = expected.get(i).copied().unwrap_or(0);
        diff |= u64::from(a ^ b);
    }

    diff == 0
}

/// Extracts the bearer token from an Authorization header value.
///
/// Expected format: "Bearer <token>", prefix matched case-insensitively.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    if header.len() < 7 || !header.is_char_boundary(7) {
        return None;
    }

    let (prefix, token) = header.split_at(7);
    if !prefix.eq_ignore_ascii_case("Bearer ") {
        return None;
    }

    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// First credential found in the request, if any.
pub fn provided_secret<'a>(headers: &'a HeaderMap, body_secret: Option<&'a str>) -> Option<&'a str> {
    if let Some(value) = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value);
        }
    }

    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
    {
        return Some(token);
    }

    body_secret.filter(|s| !s.is_empty())
}

/// Whether the request may trigger a rebuild. Always `false` when no secret is
/// configured.
pub fn authorize(expected: Option<&str>, headers: &HeaderMap, body_secret: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };

    match provided_secret(headers, body_secret) {
        Some(provided) => validate_secret(provided, expected),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_validate_secret_matching() {
        assert!(validate_secret("secret123", "secret123"));
        assert!(validate_secret("a", "a"));
    }

    #[test]
    fn test_validate_secret_mismatch() {
        assert!(!validate_secret("secret123", "secret124"));
        assert!(!validate_secret("secret123", "SECRET123"));
        assert!(!validate_secret("short", "shorter"));
        assert!(!validate_secret("shorter", "short"));
        assert!(!validate_secret("", "secret"));
        assert!(!validate_secret("secret", ""));
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer   abc  "), Some("abc"));
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Beärer abc"), None);
    }

    #[test]
    fn test_header_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, HeaderValue::from_static("from-header"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));

        assert_eq!(provided_secret(&headers, Some("from-body")), Some("from-header"));
    }

    #[test]
    fn test_bearer_then_body() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(provided_secret(&headers, Some("from-body")), Some("from-bearer"));

        let empty = HeaderMap::new();
        assert_eq!(provided_secret(&empty, Some("from-body")), Some("from-body"));
        assert_eq!(provided_secret(&empty, None), None);
    }

    #[test]
    fn test_authorize() {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cret"));

        assert!(authorize(Some("s3cret"), &headers, None));
        assert!(!authorize(Some("other"), &headers, None));
        // no configured secret never authorizes
        assert!(!authorize(None, &headers, None));
        assert!(!authorize(Some("s3cret"), &HeaderMap::new(), None));
    }
}
