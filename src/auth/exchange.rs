//! Token exchange and normalization
//!
//! A captured redirect arrives in one of three shapes:
//! - direct token: the redirect already carries an `id_token`
//! - code: the redirect carries a `code` to exchange at the token endpoint
//! - passthrough: the redirect itself is the token response
//!
//! All three end up as the same [`TokenRecord`].

use std::collections::BTreeMap;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use crate::Result;
use crate::browser::CapturedRedirect;
use crate::error::Error;
use super::providers::{OAuth2Config, TokenContentType};
use super::store::{TokenKind, TokenRecord};

/// Which branch produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowVariant {
    DirectToken,
    CodeExchange,
    Passthrough,
}

/// A normalized record plus what was learned along the way
#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: TokenRecord,
    pub variant: FlowVariant,
    /// Decoded ID token claims, when an ID token was delivered directly
    pub claims: Option<Map<String, Value>>,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// What the PKCE code flow sent, needed to finish it
#[derive(Debug, Clone, Copy)]
pub struct PkceContext<'a> {
    pub code_verifier: &'a str,
    pub state: &'a str,
}

/// Turn a captured redirect into a token record
pub async fn normalize(
    http: &Client,
    provider: &str,
    config: &OAuth2Config,
    captured: &CapturedRedirect,
    pkce: PkceContext<'_>,
) -> Result<Normalized> {
    if let Some(id_token) = captured.get("id_token").filter(|v| !v.is_empty()) {
        let claims = decode_jwt_payload(id_token);
        let expires_at = claims.as_ref().and_then(expiry_from_claims);

        let record = TokenRecord {
            provider: provider.to_string(),
            kind: TokenKind::OAuth2,
            access_token: Some(id_token.to_string()),
            id_token: Some(id_token.to_string()),
            refresh_token: None,
            api_key: None,
            expires_at,
            scopes: captured.get("scope").map(split_scopes),
            token_type: Some("Bearer".to_string()),
            created_at: Utc::now(),
        };

        return Ok(Normalized {
            record,
            variant: FlowVariant::DirectToken,
            claims,
        });
    }

    if let Some(code) = captured.get("code").filter(|v| !v.is_empty()) {
        let state = captured.get("state").unwrap_or(pkce.state);
        let tokens = exchange_code(
            http,
            config,
            code,
            pkce.code_verifier,
            captured.redirect_uri(),
            Some(state),
        )
        .await?;

        let record = TokenRecord {
            provider: provider.to_string(),
            kind: TokenKind::OAuth2,
            access_token: tokens.access_token,
            id_token: tokens.id_token,
            refresh_token: tokens.refresh_token,
            api_key: None,
            expires_at: tokens.expires_in.and_then(expiry_from_now),
            scopes: tokens.scope.as_deref().map(split_scopes),
            token_type: tokens.token_type,
            created_at: Utc::now(),
        };

        return Ok(Normalized {
            record,
            variant: FlowVariant::CodeExchange,
            claims: None,
        });
    }

    if let Some(error) = captured.get("error") {
        let description = captured
            .get("error_description")
            .unwrap_or("Unknown error");
        return Err(Error::Authorization(format!("{} - {}", error, description)));
    }

    let access_token = captured.get("access_token").ok_or_else(|| {
        Error::Authorization("Redirect carried no code, ID token or access token".to_string())
    })?;

    let record = TokenRecord {
        provider: provider.to_string(),
        kind: TokenKind::OAuth2,
        access_token: Some(access_token.to_string()),
        id_token: None,
        refresh_token: captured.get("refresh_token").map(str::to_string),
        api_key: None,
        expires_at: captured
            .get("expires_in")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(expiry_from_now),
        scopes: captured.get("scope").map(split_scopes),
        token_type: captured.get("token_type").map(str::to_string),
        created_at: Utc::now(),
    };

    Ok(Normalized {
        record,
        variant: FlowVariant::Passthrough,
        claims: None,
    })
}

/// Exchange an authorization code at the provider's token endpoint
///
/// Single attempt; any non-success status is returned as
/// [`Error::TokenExchange`] with the response body.
pub async fn exchange_code(
    http: &Client,
    config: &OAuth2Config,
    code: &str,
    code_verifier: &str,
    redirect_uri: &str,
    state: Option<&str>,
) -> Result<TokenResponse> {
    let mut params: BTreeMap<&str, &str> = BTreeMap::new();
    params.insert("grant_type", "authorization_code");
    params.insert("code", clean_code(code));
    params.insert("redirect_uri", redirect_uri);
    params.insert("client_id", &config.client_id);
    params.insert("code_verifier", code_verifier);
    if let Some(secret) = &config.client_secret {
        params.insert("client_secret", secret);
    }
    if let Some(state) = state {
        params.insert("state", state);
    }

    let mut request = http.post(&config.token_url);
    request = match config.token_content_type {
        TokenContentType::Json => request
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&params),
        TokenContentType::Form => request.form(&params),
    };
    for (name, value) in &config.token_headers {
        request = request.header(name.as_str(), value.as_str());
    }

    tracing::debug!("Exchanging authorization code at {}", config.token_url);
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            body,
        });
    }

    let tokens: TokenResponse = serde_json::from_str(&body)?;
    if tokens.access_token.is_none() {
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            body,
        });
    }
    Ok(tokens)
}

/// Drop fragment or extra parameters some providers glue onto the code
fn clean_code(code: &str) -> &str {
    code.split(['#', '&']).next().unwrap_or(code)
}

/// Best-effort decode of a JWT's payload segment
pub fn decode_jwt_payload(jwt: &str) -> Option<Map<String, Value>> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('=')).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

fn expiry_from_claims(claims: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(secs, 0)
}

/// Absolute expiry for a relative lifetime; `None` if it is out of range
pub(super) fn expiry_from_now(expires_in: i64) -> Option<DateTime<Utc>> {
    let expires_at = chrono::Duration::try_seconds(expires_in)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
    if expires_at.is_none() {
        tracing::warn!("Ignoring out-of-range expires_in: {}", expires_in);
    }
    expires_at
}

/// Split a scope string on whitespace and commas
pub fn split_scopes(scope: &str) -> Vec<String> {
    scope
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(token_url: String, content_type: TokenContentType) -> OAuth2Config {
        OAuth2Config {
            client_id: "client-1".to_string(),
            client_secret: Some("shh".to_string()),
            authorization_url: "https://auth.example.com/authorize".to_string(),
            token_url,
            token_content_type: content_type,
            token_headers: vec![("Origin".to_string(), "https://claude.ai".to_string())],
            redirect_uri: "http://127.0.0.1:14355/oauth2callback".to_string(),
            redirect_pattern: Regex::new("oauth2callback").unwrap(),
            scopes: "openid".to_string(),
            extra_params: Vec::new(),
        }
    }

    fn jwt(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{}.{}.sig", header, body)
    }

    const PKCE: PkceContext<'static> = PkceContext {
        code_verifier: "verifier-123",
        state: "state-abc",
    };

    #[tokio::test]
    async fn test_direct_token_flow_needs_no_network() {
        let token = jwt(json!({ "exp": 1_900_000_000, "email": "a@b.c" }));
        let captured = CapturedRedirect::parse(&format!(
            "http://localhost:1455/cb?scope=openid%20email#id_token={}",
            token
        ))
        .unwrap();
        // Unreachable token URL: any request would fail the test
        let cfg = config("http://127.0.0.1:9/token".to_string(), TokenContentType::Form);

        let before = Utc::now();
        let normalized = normalize(&Client::new(), "openai", &cfg, &captured, PKCE).await.unwrap();

        assert_eq!(normalized.variant, FlowVariant::DirectToken);
        let record = normalized.record;
        assert_eq!(record.id_token.as_deref(), Some(token.as_str()));
        assert_eq!(record.access_token.as_deref(), Some(token.as_str()));
        assert_eq!(record.expires_at, DateTime::from_timestamp(1_900_000_000, 0));
        assert_eq!(record.scopes, Some(vec!["openid".to_string(), "email".to_string()]));
        assert!(record.created_at >= before);
        assert_eq!(normalized.claims.unwrap()["email"], "a@b.c");
    }

    #[tokio::test]
    async fn test_malformed_id_token_is_not_fatal() {
        let captured = CapturedRedirect::parse("http://localhost:1455/cb#id_token=not-a-jwt").unwrap();
        let cfg = config("http://127.0.0.1:9/token".to_string(), TokenContentType::Form);

        let normalized = normalize(&Client::new(), "openai", &cfg, &captured, PKCE).await.unwrap();
        assert!(normalized.claims.is_none());
        assert!(normalized.record.expires_at.is_none());
        assert_eq!(normalized.record.id_token.as_deref(), Some("not-a-jwt"));
    }

    #[tokio::test]
    async fn test_code_exchange_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(header("origin", "https://claude.ai"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123&"))
            .and(body_string_contains("code_verifier=verifier-123"))
            .and(body_string_contains("client_secret=shh"))
            .and(body_string_contains("state=from-redirect"))
            .and(body_string_contains(
                "redirect_uri=http%3A%2F%2F127.0.0.1%3A50001%2Foauth2callback",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 3600,
                "token_type": "Bearer",
                "scope": "openid email"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let captured = CapturedRedirect::parse(
            "http://127.0.0.1:50001/oauth2callback?code=abc123&state=from-redirect",
        )
        .unwrap();
        let cfg = config(format!("{}/token", server.uri()), TokenContentType::Form);

        let normalized = normalize(&Client::new(), "gemini", &cfg, &captured, PKCE).await.unwrap();
        assert_eq!(normalized.variant, FlowVariant::CodeExchange);

        let record = normalized.record;
        assert_eq!(record.access_token.as_deref(), Some("at"));
        assert_eq!(record.refresh_token.as_deref(), Some("rt"));
        assert_eq!(record.token_type.as_deref(), Some("Bearer"));
        assert_eq!(record.scopes, Some(vec!["openid".to_string(), "email".to_string()]));

        let remaining = record.expires_at.unwrap() - Utc::now();
        assert!(remaining > chrono::Duration::seconds(3500));
        assert!(remaining <= chrono::Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_code_exchange_json_with_fallback_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("accept", "application/json"))
            .and(body_partial_json(json!({
                "grant_type": "authorization_code",
                "code": "clean",
                "state": "state-abc",
                "client_id": "client-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "json-at" })))
            .expect(1)
            .mount(&server)
            .await;

        // Code contaminated by a trailing fragment-style suffix
        let captured = CapturedRedirect::parse("https://platform.claude.com/oauth/code/callback?code=clean%23extra").unwrap();
        let cfg = config(format!("{}/token", server.uri()), TokenContentType::Json);

        let normalized = normalize(&Client::new(), "claude", &cfg, &captured, PKCE).await.unwrap();
        assert_eq!(normalized.record.access_token.as_deref(), Some("json-at"));
        assert!(normalized.record.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_exchange_failure_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("{\"error\":\"invalid_grant\"}"))
            .expect(1)
            .mount(&server)
            .await;

        let captured = CapturedRedirect::parse("http://127.0.0.1:1/oauth2callback?code=bad").unwrap();
        let cfg = config(format!("{}/token", server.uri()), TokenContentType::Form);

        let err = normalize(&Client::new(), "gemini", &cfg, &captured, PKCE).await.unwrap_err();
        match err {
            Error::TokenExchange { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "{\"error\":\"invalid_grant\"}");
            }
            other => panic!("expected TokenExchange, got {:?}", other),
        }
        // MockServer verifies `expect(1)` on drop: no retry happened
    }

    #[tokio::test]
    async fn test_success_without_access_token_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token_type": "Bearer" })))
            .mount(&server)
            .await;

        let cfg = config(format!("{}/token", server.uri()), TokenContentType::Form);
        let err = exchange_code(&Client::new(), &cfg, "c", "v", "http://x", None).await.unwrap_err();
        assert!(matches!(err, Error::TokenExchange { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_passthrough_flow() {
        let captured = CapturedRedirect::parse(
            "http://localhost:1455/cb#access_token=pt&refresh_token=rt&scope=a,b&token_type=bearer",
        )
        .unwrap();
        let cfg = config("http://127.0.0.1:9/token".to_string(), TokenContentType::Form);

        let normalized = normalize(&Client::new(), "openai", &cfg, &captured, PKCE).await.unwrap();
        assert_eq!(normalized.variant, FlowVariant::Passthrough);
        assert_eq!(normalized.record.access_token.as_deref(), Some("pt"));
        assert_eq!(normalized.record.refresh_token.as_deref(), Some("rt"));
        assert_eq!(normalized.record.scopes, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(normalized.record.token_type.as_deref(), Some("bearer"));
    }

    #[tokio::test]
    async fn test_provider_error_redirect() {
        let captured = CapturedRedirect::parse(
            "http://localhost:1455/cb?error=access_denied&error_description=User+denied",
        )
        .unwrap();
        let cfg = config("http://127.0.0.1:9/token".to_string(), TokenContentType::Form);

        let err = normalize(&Client::new(), "openai", &cfg, &captured, PKCE).await.unwrap_err();
        assert!(err.to_string().contains("access_denied"));
        assert!(err.to_string().contains("User denied"));
    }

    #[test]
    fn test_clean_code() {
        assert_eq!(clean_code("abc"), "abc");
        assert_eq!(clean_code("abc#state=x"), "abc");
        assert_eq!(clean_code("abc&foo=bar"), "abc");
    }

    #[test]
    fn test_decode_jwt_payload() {
        let claims = decode_jwt_payload(&jwt(json!({ "exp": 10, "plan_type": "plus" }))).unwrap();
        assert_eq!(claims["plan_type"], "plus");
        assert_eq!(expiry_from_claims(&claims), DateTime::from_timestamp(10, 0));

        assert!(decode_jwt_payload("a.b").is_none());
        assert!(decode_jwt_payload("a.!!!.c").is_none());
        let array = URL_SAFE_NO_PAD.encode("[1,2]");
        assert!(decode_jwt_payload(&format!("h.{}.s", array)).is_none());
    }

    #[test]
    fn test_split_scopes() {
        assert_eq!(split_scopes("a b,c  ,d"), vec!["a", "b", "c", "d"]);
        assert!(split_scopes("  ").is_empty());
    }

    #[tokio::test]
    async fn test_huge_expires_in_leaves_expiry_unset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "expires_in": i64::MAX
            })))
            .mount(&server)
            .await;

        let captured = CapturedRedirect::parse("http://127.0.0.1:1/oauth2callback?code=c").unwrap();
        let cfg = config(format!("{}/token", server.uri()), TokenContentType::Form);

        let normalized = normalize(&Client::new(), "gemini", &cfg, &captured, PKCE).await.unwrap();
        assert_eq!(normalized.record.access_token.as_deref(), Some("at"));
        assert!(normalized.record.expires_at.is_none());
    }

    #[test]
    fn test_expiry_from_now_bounds() {
        assert!(expiry_from_now(i64::MAX).is_none());
        assert!(expiry_from_now(i64::MIN).is_none());
        assert!(expiry_from_now(3600).unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_empty_id_token_falls_through_to_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=real"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "from-code" })))
            .expect(1)
            .mount(&server)
            .await;

        let captured = CapturedRedirect::parse("http://127.0.0.1:1/oauth2callback?code=real#id_token=").unwrap();
        let cfg = config(format!("{}/token", server.uri()), TokenContentType::Form);

        let normalized = normalize(&Client::new(), "gemini", &cfg, &captured, PKCE).await.unwrap();
        assert_eq!(normalized.variant, FlowVariant::CodeExchange);
        assert_eq!(normalized.record.access_token.as_deref(), Some("from-code"));
    }

    #[tokio::test]
    async fn test_empty_code_falls_through_to_passthrough() {
        let captured = CapturedRedirect::parse("http://localhost:1455/cb?code=&access_token=pt").unwrap();
        // Unreachable token URL: an exchange attempt would fail the test
        let cfg = config("http://127.0.0.1:9/token".to_string(), TokenContentType::Form);

        let normalized = normalize(&Client::new(), "openai", &cfg, &captured, PKCE).await.unwrap();
        assert_eq!(normalized.variant, FlowVariant::Passthrough);
        assert_eq!(normalized.record.access_token.as_deref(), Some("pt"));
    }
}
