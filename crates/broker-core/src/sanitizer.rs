//! Sensitive-data sanitizer for stored headers and diagnostic text.
//!
//! Outbox and DLQ rows are readable by operational tooling, so header values
//! and error messages pass through here before any persistence or logging.
//! The payload itself is not touched (it is needed verbatim for replay),
//! which is exactly why payloads must never be logged.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Replacement for masked values.
pub const MASK: &str = "***";

/// Header/field names that are never stored or logged in the clear.
const FORBIDDEN_KEYS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-authorization",
    "x-auth-token",
    "x-access-token",
    "access_token",
    "refresh_token",
    "client_secret",
];

static BEARER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+\S+").expect("bearer pattern"));

static KEY_VALUE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(client_secret|access_token|refresh_token)\s*=\s*[^\s&]+")
        .expect("key-value pattern")
});

/// Sanitize a header map for storage.
///
/// Keys are preserved; values of forbidden keys are replaced with [`MASK`],
/// all other values go through [`sanitize_text`].
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let key_norm = k.trim().to_lowercase();
            if FORBIDDEN_KEYS.contains(&key_norm.as_str()) {
                (k.clone(), MASK.to_string())
            } else {
                (k.clone(), sanitize_text(v))
            }
        })
        .collect()
}

/// Sanitize free text (error messages, diagnostic strings).
///
/// Masks `Bearer <token>` and `client_secret=`/`access_token=`/
/// `refresh_token=` values, then collapses line breaks and tabs so stored
/// messages stay single-line.
pub fn sanitize_text(text: &str) -> String {
    let masked = BEARER_PATTERN.replace_all(text, format!("Bearer {MASK}"));
    let masked = KEY_VALUE_PATTERN.replace_all(&masked, format!("${{1}}={MASK}"));
    masked
        .replace(['\r', '\n', '\t'], " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_bearer_tokens() {
        let out = sanitize_text("request failed: Authorization: Bearer eyJhbGciOi.secret");
        assert!(out.contains("Bearer ***"));
        assert!(!out.contains("eyJhbGciOi"));
    }

    #[test]
    fn masks_key_value_secrets() {
        let out = sanitize_text("POST body: client_secret=s3cr3t&scope=openid");
        assert_eq!(out, "POST body: client_secret=***&scope=openid");

        let out = sanitize_text("access_token = abc123 refresh_token=def456");
        assert!(!out.contains("abc123"));
        assert!(!out.contains("def456"));
    }

    #[test]
    fn collapses_line_breaks_and_trims() {
        let out = sanitize_text("  first\nsecond\tthird\r\n  ");
        assert_eq!(out, "first second third");
    }

    #[test]
    fn passes_through_plain_text() {
        assert_eq!(sanitize_text("connection refused"), "connection refused");
    }

    #[test]
    fn masks_forbidden_header_values() {
        let headers = HashMap::from([
            ("Authorization".to_string(), "Bearer token-value".to_string()),
            ("Cookie".to_string(), "session=abc".to_string()),
            ("X-Auth-Token".to_string(), "tok".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]);

        let out = sanitize_headers(&headers);
        assert_eq!(out["Authorization"], MASK);
        assert_eq!(out["Cookie"], MASK);
        assert_eq!(out["X-Auth-Token"], MASK);
        assert_eq!(out["Content-Type"], "application/json");
    }

    #[test]
    fn forbidden_key_match_is_case_insensitive() {
        let headers = HashMap::from([
            ("AUTHORIZATION".to_string(), "Basic dXNlcjpwYXNz".to_string()),
            ("Set-Cookie".to_string(), "a=b".to_string()),
        ]);

        let out = sanitize_headers(&headers);
        assert_eq!(out["AUTHORIZATION"], MASK);
        assert_eq!(out["Set-Cookie"], MASK);
    }

    #[test]
    fn non_forbidden_values_still_get_text_sanitization() {
        let headers = HashMap::from([(
            "X-Debug".to_string(),
            "retry with Bearer abc".to_string(),
        )]);

        let out = sanitize_headers(&headers);
        assert_eq!(out["X-Debug"], "retry with Bearer ***");
    }
}
