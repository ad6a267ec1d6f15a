//! Outbound HTTP delivery seam and connector auth resolution.
//!
//! Connector auth material lives in configuration only. It is turned into
//! headers at send time and merged over the stored (sanitized) headers, so
//! outbox rows never round-trip a secret through the database.

use async_trait::async_trait;
use base64::Engine;
use broker_config::{ConnectorAuth, ConnectorAuthType};
use broker_core::sanitize_text;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one HTTP delivery attempt.
///
/// `http_status` is -1 when the request never produced a response.
#[derive(Debug, Clone)]
pub struct HttpSendOutcome {
    pub success: bool,
    pub http_status: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl HttpSendOutcome {
    pub fn ok(http_status: i64) -> Self {
        Self {
            success: true,
            http_status,
            error_code: None,
            error_message: None,
        }
    }

    pub fn fail(code: &str, message: &str, http_status: i64) -> Self {
        Self {
            success: false,
            http_status,
            error_code: Some(sanitize_text(code)),
            error_message: Some(sanitize_text(message)),
        }
    }
}

/// HTTP sender behind the outbox.
///
/// A trait seam so the dispatcher can be tested without network calls and
/// the implementation can be swapped (proxies, mTLS, ...).
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body_json: Option<&str>,
        idempotency_header_name: &str,
        idempotency_key: Option<&str>,
    ) -> HttpSendOutcome;
}

/// Default sender on top of reqwest with short, explicit timeouts.
pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl Default for ReqwestHttpSender {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl HttpSender for ReqwestHttpSender {
    async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body_json: Option<&str>,
        idempotency_header_name: &str,
        idempotency_key: Option<&str>,
    ) -> HttpSendOutcome {
        let method = method.trim().to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let has_body = !matches!(method, reqwest::Method::GET | reqwest::Method::DELETE);

        let mut request = self.client.request(method, url);

        let mut has_content_type = false;
        for (name, value) in headers {
            if name.trim().is_empty() {
                continue;
            }
            if name.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            request = request.header(name, value);
        }

        if let (false, Some(key)) = (idempotency_header_name.trim().is_empty(), idempotency_key) {
            if !key.trim().is_empty() {
                request = request.header(idempotency_header_name, key);
            }
        }

        if has_body {
            if !has_content_type {
                request = request.header("Content-Type", "application/json");
            }
            request = request.body(body_json.unwrap_or("").to_string());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16() as i64;
                if (200..300).contains(&status) {
                    HttpSendOutcome::ok(status)
                } else {
                    HttpSendOutcome::fail(
                        &format!("HTTP_{status}"),
                        &format!("HTTP call failed with status {status}"),
                        status,
                    )
                }
            }
            Err(e) => HttpSendOutcome::fail("HTTP_CLIENT_ERROR", &e.to_string(), -1),
        }
    }
}

/// Join a connector base URL with a stored relative path.
pub fn build_url(base_url: Option<&str>, path: Option<&str>) -> String {
    let base = base_url.unwrap_or("").trim().trim_end_matches('/');
    let path = path.unwrap_or("").trim();

    if path.is_empty() {
        return base.to_string();
    }
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Resolves connector auth into request headers at send time.
///
/// OAuth2 client-credentials tokens are fetched from the token endpoint and
/// cached in memory per (token url, client id, scope, audience) with an
/// expiry margin.
pub struct ConnectorAuthResolver {
    client: reqwest::Client,
    token_cache: Mutex<HashMap<String, CachedToken>>,
}

impl ConnectorAuthResolver {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build the auth headers for a connector. Incomplete auth configuration
    /// yields no headers rather than an error; the downstream call then
    /// fails visibly with the real HTTP status.
    pub async fn resolve_headers(&self, auth: &ConnectorAuth) -> HashMap<String, String> {
        match auth.auth_type {
            ConnectorAuthType::None => HashMap::new(),
            ConnectorAuthType::ApiKeyHeader => {
                let Some(api_key) = non_blank(auth.api_key.as_deref()) else {
                    return HashMap::new();
                };
                let name = non_blank(auth.header_name.as_deref())
                    .unwrap_or_else(|| "X-API-Key".to_string());
                HashMap::from([(name, api_key)])
            }
            ConnectorAuthType::Bearer => match non_blank(auth.bearer_token.as_deref()) {
                Some(token) => {
                    HashMap::from([("Authorization".to_string(), format!("Bearer {token}"))])
                }
                None => HashMap::new(),
            },
            ConnectorAuthType::Basic => {
                let (Some(user), Some(password)) =
                    (auth.basic_username.as_deref(), auth.basic_password.as_deref())
                else {
                    return HashMap::new();
                };
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{user}:{password}"));
                HashMap::from([("Authorization".to_string(), format!("Basic {token}"))])
            }
            ConnectorAuthType::Oauth2ClientCredentials => {
                match self.resolve_access_token(auth).await {
                    Some(token) => {
                        HashMap::from([("Authorization".to_string(), format!("Bearer {token}"))])
                    }
                    None => HashMap::new(),
                }
            }
        }
    }

    async fn resolve_access_token(&self, auth: &ConnectorAuth) -> Option<String> {
        let token_url = non_blank(auth.token_url.as_deref())?;
        let client_id = non_blank(auth.client_id.as_deref())?;
        let client_secret = non_blank(auth.client_secret.as_deref())?;
        let scope = non_blank(auth.scope.as_deref());
        let audience = non_blank(auth.audience.as_deref());

        let cache_key = format!(
            "{token_url}|{client_id}|{}|{}",
            scope.as_deref().unwrap_or(""),
            audience.as_deref().unwrap_or("")
        );

        {
            let cache = self.token_cache.lock().expect("token cache poisoned");
            if let Some(cached) = cache.get(&cache_key) {
                if cached.expires_at.saturating_duration_since(Instant::now())
                    > Duration::from_secs(10)
                {
                    return Some(cached.access_token.clone());
                }
            }
        }

        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), client_id),
            ("client_secret".to_string(), client_secret),
        ];
        if let Some(scope) = scope {
            form.push(("scope".to_string(), scope));
        }
        if let Some(audience) = audience {
            form.push(("audience".to_string(), audience));
        }

        let response = match self
            .client
            .post(&token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(token_url = %token_url, status = %response.status(), "OAuth2 token request rejected");
                return None;
            }
            Err(e) => {
                warn!(token_url = %token_url, error = %sanitize_text(&e.to_string()), "OAuth2 token request failed");
                return None;
            }
        };

        let parsed: TokenResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(token_url = %token_url, error = %e, "OAuth2 token response unreadable");
                return None;
            }
        };

        let access_token = non_blank(parsed.access_token.as_deref())?;
        let expires_in = parsed.expires_in.unwrap_or(60).max(15);

        debug!(token_url = %token_url, expires_in, "OAuth2 token refreshed");

        let mut cache = self.token_cache.lock().expect("token cache poisoned");
        cache.insert(
            cache_key,
            CachedToken {
                access_token: access_token.clone(),
                expires_at: Instant::now() + Duration::from_secs(expires_in),
            },
        );
        Some(access_token)
    }

    #[cfg(test)]
    fn seed_token(&self, key: &str, token: &str, valid_for: Duration) {
        self.token_cache.lock().unwrap().insert(
            key.to_string(),
            CachedToken {
                access_token: token.to_string(),
                expires_at: Instant::now() + valid_for,
            },
        );
    }
}

impl Default for ConnectorAuthResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
