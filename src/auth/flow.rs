//! Authentication orchestration
//!
//! [`Authenticator`] runs one provider's flow end to end and persists the
//! result. A record is only written once it is complete, so a failure at any
//! step leaves the store untouched for that provider.

use std::sync::Arc;
use reqwest::Client;
use serde_json::{Map, Value};
use crate::Result;
use crate::browser::{capture_redirect, BrowserLauncher, CaptureOptions};
use crate::config::{AppConfig, Environment};
use crate::error::Error;
use crate::prompt::Prompter;
use crate::ui;
use super::authorize::build_auth_url;
use super::device;
use super::discovery::CredentialResolver;
use super::exchange::{self, PkceContext};
use super::pkce::{generate_state, PkcePair};
use super::providers::{ApiKeyConfig, FlowKind, OAuth2Config, ProviderConfig, ProviderId};
use super::store::{TokenRecord, TokenStore};

/// Runs authentication flows against injected collaborators
pub struct Authenticator {
    config: AppConfig,
    env: Environment,
    http: Client,
    prompter: Box<dyn Prompter>,
    launcher: Arc<dyn BrowserLauncher>,
    store: TokenStore,
}

impl Authenticator {
    pub fn new(
        config: AppConfig,
        env: Environment,
        prompter: Box<dyn Prompter>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        let store = TokenStore::new(config.store_path.clone());
        Self {
            config,
            env,
            http: Client::new(),
            prompter,
            launcher,
            store,
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Authenticate `provider` and save the resulting record
    pub async fn run(&self, provider: ProviderId) -> Result<TokenRecord> {
        ui::print_header(provider.display_name());

        let provider_config = match provider.flow_kind() {
            FlowKind::ApiKey => provider.build(None)?,
            FlowKind::OAuth2 | FlowKind::DeviceFlow => {
                let resolver = CredentialResolver::new(
                    &self.env,
                    self.prompter.as_ref(),
                    self.http.clone(),
                    self.config.discovery_timeout(),
                );
                let credentials = resolver.resolve(provider).await?;
                provider.build(Some(credentials))?
            }
        };

        let record = match &provider_config {
            ProviderConfig::OAuth2(config) => self.oauth_flow(provider, config).await?,
            ProviderConfig::DeviceFlow(config) => {
                device::run_device_flow(
                    &self.http,
                    provider.as_str(),
                    config,
                    &self.config.device,
                    device::open_in_system,
                )
                .await?
            }
            ProviderConfig::ApiKey(config) => self.api_key_flow(provider, config)?,
        };

        self.store.save_token(provider.as_str(), record.clone())?;
        ui::print_success(&format!(
            "Saved {} credentials to {}",
            provider.display_name(),
            self.store.path().display()
        ));

        Ok(record)
    }

    async fn oauth_flow(&self, provider: ProviderId, config: &OAuth2Config) -> Result<TokenRecord> {
        let pkce = PkcePair::new();
        let state = generate_state();
        let auth_url = build_auth_url(config, &pkce.challenge, &state)?;
        tracing::debug!("Authorization URL: {}", auth_url);

        ui::print_step("Opening browser for sign-in...");
        let session = self.launcher.launch().await?;

        let options = CaptureOptions {
            deadline: self.config.capture_timeout(),
            liveness_interval: self.config.liveness_interval(),
        };
        let captured = capture_redirect(session.as_ref(), &auth_url, &config.redirect_pattern, &options).await;
        session.close().await;
        let captured = captured?;

        ui::print_success("Redirect captured.");

        let normalized = exchange::normalize(
            &self.http,
            provider.as_str(),
            config,
            &captured,
            PkceContext {
                code_verifier: &pkce.verifier,
                state: &state,
            },
        )
        .await?;

        if let Some(claims) = &normalized.claims {
            show_claims(claims);
        }

        Ok(normalized.record)
    }

    fn api_key_flow(&self, provider: ProviderId, config: &ApiKeyConfig) -> Result<TokenRecord> {
        ui::print_step(&config.instruction);

        let key = self
            .prompter
            .ask_secret(&format!("Paste your {} API key:", provider.display_name()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Prompt("No API key provided".to_string()));
        }

        Ok(TokenRecord::api_key(provider.as_str(), key.to_string()))
    }
}

/// Print the identity claims worth seeing from an ID token
fn show_claims(claims: &Map<String, Value>) {
    if let Some(email) = claims.get("email").and_then(Value::as_str) {
        ui::print_step(&format!("Signed in as {}", email));
    }

    let plan = claims.get("plan_type").or_else(|| {
        claims
            .get("https://api.openai.com/auth")
            .and_then(|auth| auth.get("chatgpt_plan_type"))
    });
    if let Some(plan) = plan.and_then(Value::as_str) {
        ui::print_step(&format!("Plan: {}", plan));
    }

    if let Some(exp) = claims
        .get("exp")
        .and_then(Value::as_i64)
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
    {
        ui::print_step(&format!("Token expires {}", exp.to_rfc3339()));
    }
}
