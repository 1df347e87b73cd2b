//! Layered discovery of OAuth2 client credentials
//!
//! Each provider is resolved through three layers, stopping at the first hit:
//! 1. Provider-specific environment variables
//! 2. The upstream CLI's public source file, scraped with a regex
//! 3. A URL pasted by the operator, read for its `client_id` parameter
//!
//! Only the last layer can fail the run; the first two quietly fall through.

use std::time::Duration;
use regex::Regex;
use url::Url;
use crate::Result;
use crate::config::Environment;
use crate::error::Error;
use crate::prompt::Prompter;
use crate::ui;
use super::providers::ProviderId;

/// OAuth2 client credentials resolved for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Public document holding an upstream CLI's embedded client credentials
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub url: String,
    pub client_id_pattern: &'static str,
    pub client_secret_pattern: Option<&'static str>,
}

/// Where to look for one provider's credentials
#[derive(Debug, Clone)]
pub struct DiscoveryEntry {
    pub client_id_var: &'static str,
    pub client_secret_var: Option<&'static str>,
    pub source: Option<SourceConfig>,
    /// Tells the operator how to obtain an authorization URL by hand
    pub fallback_hint: &'static str,
}

/// Discovery table; `None` for providers that need no client credentials
pub fn discovery_entry(provider: ProviderId) -> Option<DiscoveryEntry> {
    match provider {
        ProviderId::OpenAi => Some(DiscoveryEntry {
            client_id_var: "OPENAI_CLIENT_ID",
            client_secret_var: None,
            source: Some(SourceConfig {
                url: "https://raw.githubusercontent.com/openai/codex/main/codex-rs/core/src/auth.rs"
                    .to_string(),
                client_id_pattern: r#"CLIENT_ID:\s*&str\s*=\s*"([^"]+)""#,
                client_secret_pattern: None,
            }),
            fallback_hint: "Run \"codex login\" and paste the URL that opens in your browser",
        }),
        ProviderId::Gemini => Some(DiscoveryEntry {
            client_id_var: "GEMINI_CLIENT_ID",
            client_secret_var: Some("GEMINI_CLIENT_SECRET"),
            source: Some(SourceConfig {
                url: "https://raw.githubusercontent.com/google-gemini/gemini-cli/main/packages/core/src/code_assist/oauth2.ts"
                    .to_string(),
                client_id_pattern: r"OAUTH_CLIENT_ID\s*=\s*'([^']+)'",
                client_secret_pattern: Some(r"OAUTH_CLIENT_SECRET\s*=\s*'([^']+)'"),
            }),
            fallback_hint: "Run \"gemini login\" and paste the URL that opens in your browser",
        }),
        ProviderId::Claude => Some(DiscoveryEntry {
            client_id_var: "CLAUDE_CLIENT_ID",
            client_secret_var: None,
            source: None,
            fallback_hint: "Run \"claude login\" and paste the URL that opens in your browser",
        }),
        ProviderId::Copilot => Some(DiscoveryEntry {
            client_id_var: "COPILOT_CLIENT_ID",
            client_secret_var: None,
            source: None,
            fallback_hint: "Run \"gh copilot\" and paste the OAuth URL, or check copilot.vim source",
        }),
        ProviderId::Anthropic | ProviderId::OpenRouter => None,
    }
}

/// Resolves client credentials against an injected environment snapshot
pub struct CredentialResolver<'a> {
    env: &'a Environment,
    prompter: &'a dyn Prompter,
    http: reqwest::Client,
    timeout: Duration,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(
        env: &'a Environment,
        prompter: &'a dyn Prompter,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            env,
            prompter,
            http,
            timeout,
        }
    }

    /// Resolve credentials for a provider that has a discovery entry
    pub async fn resolve(&self, provider: ProviderId) -> Result<ClientCredentials> {
        let entry = discovery_entry(provider).ok_or_else(|| {
            Error::Discovery(format!("No discovery config for provider: {}", provider))
        })?;
        self.resolve_entry(provider.as_str(), &entry).await
    }

    /// Run the three layers for an explicit entry
    pub async fn resolve_entry(&self, name: &str, entry: &DiscoveryEntry) -> Result<ClientCredentials> {
        if let Some(creds) = from_env(self.env, entry) {
            tracing::debug!("Using {} from the environment", entry.client_id_var);
            return Ok(creds);
        }

        if let Some(source) = &entry.source {
            ui::print_thinking("Fetching credentials from upstream source");
            if let Some(creds) = self.from_source(source).await {
                ui::print_success("Credentials discovered automatically.");
                return Ok(creds);
            }
            ui::print_warning("Could not fetch credentials from source.");
        }

        println!("\nNo credentials found for {}.", name);
        println!("{}:\n", entry.fallback_hint);

        let raw_url = self.prompter.ask(">")?;
        from_url(&raw_url).ok_or_else(|| {
            Error::Discovery("Could not extract client_id from the URL provided.".to_string())
        })
    }

    /// Fetch and scrape the upstream source; every failure means "nothing here"
    async fn from_source(&self, source: &SourceConfig) -> Option<ClientCredentials> {
        let response = match self.http.get(&source.url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Upstream credential fetch failed: {}", e);
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::warn!("Upstream credential source returned {}", response.status());
            return None;
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to read upstream credential source: {}", e);
                return None;
            }
        };

        extract_from_content(&text, source)
    }
}

fn from_env(env: &Environment, entry: &DiscoveryEntry) -> Option<ClientCredentials> {
    let client_id = env.get(entry.client_id_var)?;
    let client_secret = entry
        .client_secret_var
        .and_then(|var| env.get(var))
        .map(str::to_string);

    Some(ClientCredentials {
        client_id: client_id.to_string(),
        client_secret,
    })
}

/// Extract credentials from source text using the configured patterns
fn extract_from_content(content: &str, source: &SourceConfig) -> Option<ClientCredentials> {
    let client_id = find_match(source.client_id_pattern, content)?;
    let client_secret = source
        .client_secret_pattern
        .and_then(|pattern| find_match(pattern, content));

    Some(ClientCredentials {
        client_id,
        client_secret,
    })
}

/// Return the first capture group of `pattern` in `content`
fn find_match(pattern: &str, content: &str) -> Option<String> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::warn!("Invalid discovery pattern {}: {}", pattern, e);
            return None;
        }
    };
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

/// Read `client_id` from a pasted authorization URL
fn from_url(raw_url: &str) -> Option<ClientCredentials> {
    let url = Url::parse(raw_url.trim()).ok()?;
    let client_id = url
        .query_pairs()
        .find(|(key, _)| key == "client_id")
        .map(|(_, value)| value.into_owned())
        .filter(|id| !id.is_empty())?;

    Some(ClientCredentials {
        client_id,
        client_secret: None,
    })
}
