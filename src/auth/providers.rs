//! Provider registry
//!
//! Every supported provider is a variant of [`ProviderId`] with its own
//! factory producing one of three flow shapes. Configs are built per run and
//! never mutated afterwards.

use std::fmt;
use std::str::FromStr;
use regex::Regex;
use crate::Result;
use crate::error::Error;
use super::discovery::ClientCredentials;

/// How the token endpoint expects its request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenContentType {
    Json,
    Form,
}

/// Authorization-code-with-PKCE provider
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub authorization_url: String,
    pub token_url: String,
    pub token_content_type: TokenContentType,
    /// Extra headers sent with the token exchange request
    pub token_headers: Vec<(String, String)>,
    pub redirect_uri: String,
    /// Matches the URL that carries the authorization outcome
    pub redirect_pattern: Regex,
    pub scopes: String,
    pub extra_params: Vec<(String, String)>,
}

/// Device-code provider
#[derive(Debug, Clone)]
pub struct DeviceFlowConfig {
    pub client_id: String,
    pub device_code_url: String,
    pub token_url: String,
    pub scopes: String,
    pub headers: Vec<(String, String)>,
}

/// Provider that only needs a pasted API key
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub instruction: String,
}

/// Flow shape for a provider
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OAuth2(OAuth2Config),
    DeviceFlow(DeviceFlowConfig),
    ApiKey(ApiKeyConfig),
}

/// Which flow a provider uses, known before any credentials are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    OAuth2,
    DeviceFlow,
    ApiKey,
}

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenAi,
    Gemini,
    Claude,
    Copilot,
    Anthropic,
    OpenRouter,
}

impl ProviderId {
    /// All providers in display order
    pub fn all() -> &'static [ProviderId] {
        &[
            ProviderId::OpenAi,
            ProviderId::Gemini,
            ProviderId::Claude,
            ProviderId::Copilot,
            ProviderId::Anthropic,
            ProviderId::OpenRouter,
        ]
    }

    /// Key used on the command line and in the token store
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Gemini => "gemini",
            ProviderId::Claude => "claude",
            ProviderId::Copilot => "copilot",
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenRouter => "openrouter",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OpenAI (Codex CLI)",
            ProviderId::Gemini => "Gemini CLI",
            ProviderId::Claude => "Claude Code",
            ProviderId::Copilot => "GitHub Copilot",
            ProviderId::Anthropic => "Anthropic API",
            ProviderId::OpenRouter => "OpenRouter",
        }
    }

    pub fn flow_kind(&self) -> FlowKind {
        match self {
            ProviderId::OpenAi | ProviderId::Gemini | ProviderId::Claude => FlowKind::OAuth2,
            ProviderId::Copilot => FlowKind::DeviceFlow,
            ProviderId::Anthropic | ProviderId::OpenRouter => FlowKind::ApiKey,
        }
    }

    /// Comma-separated provider names for usage text
    pub fn names() -> String {
        Self::all()
            .iter()
            .map(ProviderId::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Build the provider config
    ///
    /// `credentials` must be `Some` for OAuth2 and device-flow providers.
    pub fn build(&self, credentials: Option<ClientCredentials>) -> Result<ProviderConfig> {
        if self.flow_kind() == FlowKind::ApiKey {
            return Ok(match self {
                ProviderId::Anthropic => anthropic(),
                _ => openrouter(),
            });
        }

        let credentials = credentials.ok_or_else(|| {
            Error::Config(format!("{} requires client credentials", self.display_name()))
        })?;

        match self {
            ProviderId::OpenAi => openai(credentials),
            ProviderId::Gemini => gemini(credentials),
            ProviderId::Claude => claude(credentials),
            _ => Ok(copilot(credentials)),
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| Error::UnknownProvider(s.to_string()))
    }
}

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| Error::Config(format!("Invalid redirect pattern {}: {}", re, e)))
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn openai(credentials: ClientCredentials) -> Result<ProviderConfig> {
    Ok(ProviderConfig::OAuth2(OAuth2Config {
        client_id: credentials.client_id,
        client_secret: credentials.client_secret,
        authorization_url: "https://auth.openai.com/oauth/authorize".to_string(),
        token_url: "https://auth.openai.com/oauth/token".to_string(),
        token_content_type: TokenContentType::Form,
        token_headers: Vec::new(),
        redirect_uri: "http://localhost:1455/auth/callback".to_string(),
        redirect_pattern: pattern(r"localhost:1455/")?,
        scopes: "openid profile email offline_access".to_string(),
        extra_params: pairs(&[
            ("id_token_add_organizations", "true"),
            ("codex_cli_simplified_flow", "true"),
        ]),
    }))
}

fn gemini(credentials: ClientCredentials) -> Result<ProviderConfig> {
    Ok(ProviderConfig::OAuth2(OAuth2Config {
        client_id: credentials.client_id,
        client_secret: credentials.client_secret,
        authorization_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
        token_url: "https://oauth2.googleapis.com/token".to_string(),
        token_content_type: TokenContentType::Form,
        token_headers: Vec::new(),
        redirect_uri: "http://127.0.0.1:14355/oauth2callback".to_string(),
        redirect_pattern: pattern(r"^http://127\.0\.0\.1:\d+/oauth2callback")?,
        scopes: [
            "https://www.googleapis.com/auth/cloud-platform",
            "https://www.googleapis.com/auth/userinfo.email",
            "https://www.googleapis.com/auth/userinfo.profile",
        ]
        .join(" "),
        extra_params: pairs(&[("access_type", "offline")]),
    }))
}

fn claude(credentials: ClientCredentials) -> Result<ProviderConfig> {
    Ok(ProviderConfig::OAuth2(OAuth2Config {
        client_id: credentials.client_id,
        client_secret: credentials.client_secret,
        authorization_url: "https://claude.ai/oauth/authorize".to_string(),
        token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
        token_content_type: TokenContentType::Json,
        token_headers: pairs(&[
            ("Referer", "https://claude.ai/"),
            ("Origin", "https://claude.ai"),
        ]),
        redirect_uri: "https://platform.claude.com/oauth/code/callback".to_string(),
        redirect_pattern: pattern(r"^https://platform\.claude\.com/oauth/code/callback\?")?,
        scopes: "org:create_api_key user:profile user:inference user:sessions:claude_code user:mcp_servers"
            .to_string(),
        extra_params: pairs(&[("code", "true")]),
    }))
}

fn copilot(credentials: ClientCredentials) -> ProviderConfig {
    ProviderConfig::DeviceFlow(DeviceFlowConfig {
        client_id: credentials.client_id,
        device_code_url: "https://github.com/login/device/code".to_string(),
        token_url: "https://github.com/login/oauth/access_token".to_string(),
        scopes: "read:user".to_string(),
        headers: pairs(&[
            ("editor-version", "Neovim/0.6.1"),
            ("editor-plugin-version", "copilot.vim/1.16.0"),
            ("user-agent", "GithubCopilot/1.155.0"),
        ]),
    })
}

fn anthropic() -> ProviderConfig {
    ProviderConfig::ApiKey(ApiKeyConfig {
        instruction: "Create a key at https://console.anthropic.com/settings/keys".to_string(),
    })
}

fn openrouter() -> ProviderConfig {
    ProviderConfig::ApiKey(ApiKeyConfig {
        instruction: "Create a key at https://openrouter.ai/settings/keys".to_string(),
    })
}
