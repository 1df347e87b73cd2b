//! Authorization URL construction

use url::Url;
use crate::Result;
use crate::error::Error;
use super::providers::OAuth2Config;

/// Query members every authorization request carries
const REQUIRED_PARAMS: &[&str] = &[
    "response_type",
    "client_id",
    "redirect_uri",
    "scope",
    "code_challenge",
    "code_challenge_method",
    "state",
];

/// Build the authorization URL for a PKCE code flow
///
/// Provider `extra_params` are appended after the required members and can
/// never replace them.
pub fn build_auth_url(config: &OAuth2Config, code_challenge: &str, state: &str) -> Result<String> {
    let mut url = Url::parse(&config.authorization_url)
        .map_err(|e| Error::Config(format!("Invalid auth URL: {}", e)))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("scope", &config.scopes)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);

        for (key, value) in &config.extra_params {
            if REQUIRED_PARAMS.contains(&key.as_str()) {
                tracing::warn!("Ignoring provider parameter {} that shadows a required one", key);
                continue;
            }
            query.append_pair(key, value);
        }
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use regex::Regex;
    use crate::auth::providers::TokenContentType;

    fn config(extra: &[(&str, &str)]) -> OAuth2Config {
        OAuth2Config {
            client_id: "client-1".to_string(),
            client_secret: None,
            authorization_url: "https://auth.example.com/oauth/authorize".to_string(),
            token_url: "https://auth.example.com/oauth/token".to_string(),
            token_content_type: TokenContentType::Form,
            token_headers: Vec::new(),
            redirect_uri: "http://localhost:1455/auth/callback".to_string(),
            redirect_pattern: Regex::new("localhost:1455/").unwrap(),
            scopes: "openid profile email".to_string(),
            extra_params: extra.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn query(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    #[test]
    fn test_required_members() {
        let url = build_auth_url(&config(&[]), "challenge-xyz", "state-1").unwrap();
        assert!(url.starts_with("https://auth.example.com/oauth/authorize?"));

        let q = query(&url);
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["client_id"], "client-1");
        assert_eq!(q["redirect_uri"], "http://localhost:1455/auth/callback");
        assert_eq!(q["scope"], "openid profile email");
        assert_eq!(q["code_challenge"], "challenge-xyz");
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["state"], "state-1");
    }

    #[test]
    fn test_extra_params_add_but_never_replace() {
        let url = build_auth_url(
            &config(&[("access_type", "offline"), ("state", "hijacked"), ("code", "true")]),
            "c",
            "real-state",
        )
        .unwrap();

        let q = query(&url);
        assert_eq!(q["access_type"], "offline");
        assert_eq!(q["code"], "true");
        assert_eq!(q["state"], "real-state");
        assert_eq!(url.matches("state=").count(), 1);
    }

    #[test]
    fn test_deterministic() {
        let c = config(&[("a", "1")]);
        assert_eq!(build_auth_url(&c, "x", "y").unwrap(), build_auth_url(&c, "x", "y").unwrap());
    }

    #[test]
    fn test_spaces_encoded() {
        let url = build_auth_url(&config(&[]), "c", "s").unwrap();
        assert!(url.contains("scope=openid+profile+email"));
    }
}
