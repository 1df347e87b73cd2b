//! Device-code flow
//!
//! REQUESTING: ask the device-code endpoint for a user code.
//! POLLING: sleep, then ask the token endpoint whether the user approved.
//! TERMINAL: an access token, or any error other than
//! `authorization_pending` / `slow_down`.

use std::time::Duration;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use crate::Result;
use crate::config::DeviceConfig;
use crate::error::Error;
use crate::ui;
use super::exchange::{expiry_from_now, split_scopes, TokenResponse};
use super::providers::DeviceFlowConfig;
use super::store::{TokenKind, TokenRecord};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Upper bound on a server-dictated poll interval
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Opens the verification page for the user
pub type PageOpener = fn(&str) -> std::io::Result<()>;

/// Open in the system's default handler
pub fn open_in_system(url: &str) -> std::io::Result<()> {
    open::that(url)
}

/// Response from the device-code endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Delay between polls: a fixed base plus a one-time penalty after `slow_down`
#[derive(Debug, Clone)]
pub struct PollSchedule {
    base: Duration,
    penalty: Duration,
    penalty_pending: bool,
}

impl PollSchedule {
    pub fn new(base: Duration, penalty: Duration) -> Self {
        Self {
            base,
            penalty,
            penalty_pending: false,
        }
    }

    /// Delay before the next poll; consumes a pending penalty
    pub fn next_delay(&mut self) -> Duration {
        if std::mem::take(&mut self.penalty_pending) {
            self.base + self.penalty
        } else {
            self.base
        }
    }

    pub fn slow_down(&mut self) {
        self.penalty_pending = true;
    }
}

/// Outcome of a single poll
#[derive(Debug)]
enum PollOutcome {
    Pending,
    SlowDown,
    Granted(TokenResponse),
}

/// Run the whole device flow and build the record
pub async fn run_device_flow(
    http: &Client,
    provider: &str,
    config: &DeviceFlowConfig,
    settings: &DeviceConfig,
    open_page: PageOpener,
) -> Result<TokenRecord> {
    let device = request_device_code(http, config).await?;

    println!();
    ui::print_step(&format!("Open {}", device.verification_uri));
    ui::print_step(&format!("Enter code: {}", device.user_code));
    println!();

    if let Err(e) = open_page(&device.verification_uri) {
        tracing::debug!("Could not open verification page: {}", e);
    }

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("  {spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message("Waiting for authorization...");
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = poll_for_token(http, config, &device, settings).await;
    spinner.finish_and_clear();
    let tokens = result?;

    Ok(TokenRecord {
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
    })
}

/// REQUESTING: obtain a device code and user code
pub async fn request_device_code(http: &Client, config: &DeviceFlowConfig) -> Result<DeviceCode> {
    let request = http.post(&config.device_code_url).json(&json!({
        "client_id": config.client_id,
        "scope": config.scopes,
    }));

    let response = with_headers(request, config).send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            body,
        });
    }

    let device: DeviceCode = serde_json::from_str(&body)?;
    tracing::debug!(
        interval = ?device.interval,
        expires_in = ?device.expires_in,
        "Device code issued"
    );
    Ok(device)
}

/// POLLING: wait for the user to approve the device code
///
/// The poll deadline is the code's advertised lifetime, or the configured
/// default when the server gives none or one too large to represent.
pub async fn poll_for_token(
    http: &Client,
    config: &DeviceFlowConfig,
    device: &DeviceCode,
    settings: &DeviceConfig,
) -> Result<TokenResponse> {
    let mut schedule = PollSchedule::new(
        poll_interval(device, settings),
        Duration::from_secs(settings.slow_down_penalty_secs).min(MAX_POLL_INTERVAL),
    );

    let started = Instant::now();
    let default_lifetime = Duration::from_secs(settings.default_lifetime_secs);
    let advertised = Duration::from_secs(device.expires_in.unwrap_or(settings.default_lifetime_secs));
    let (lifetime, deadline) = match started.checked_add(advertised) {
        Some(deadline) => (advertised, deadline),
        None => {
            tracing::warn!("Ignoring out-of-range device code lifetime: {:?}", device.expires_in);
            (default_lifetime, started.checked_add(default_lifetime).unwrap_or(started))
        }
    };

    loop {
        let delay = schedule.next_delay();
        let next_poll = Instant::now().checked_add(delay);
        if next_poll.map_or(true, |at| at > deadline) {
            return Err(Error::DeviceFlow {
                code: "expired_token".to_string(),
                description: Some(format!(
                    "device code not approved within {} seconds",
                    lifetime.as_secs()
                )),
            });
        }
        tokio::time::sleep(delay).await;

        match poll_once(http, config, &device.device_code).await? {
            PollOutcome::Pending => tracing::debug!("Authorization pending"),
            PollOutcome::SlowDown => {
                tracing::debug!("Server asked to slow down");
                schedule.slow_down();
            }
            PollOutcome::Granted(tokens) => return Ok(tokens),
        }
    }
}

/// Server-dictated interval, else the configured default, capped
fn poll_interval(device: &DeviceCode, settings: &DeviceConfig) -> Duration {
    let secs = device.interval.unwrap_or(settings.default_interval_secs);
    Duration::from_secs(secs).min(MAX_POLL_INTERVAL)
}

async fn poll_once(http: &Client, config: &DeviceFlowConfig, device_code: &str) -> Result<PollOutcome> {
    let request = http.post(&config.token_url).json(&json!({
        "client_id": config.client_id,
        "device_code": device_code,
        "grant_type": DEVICE_CODE_GRANT,
    }));

    let response = with_headers(request, config).send().await?;
    let status = response.status();
    let body = response.text().await?;

    // Some servers report pending/denied with 200, others with 400
    let parsed: Option<Value> = serde_json::from_str(&body).ok();
    if let Some(code) = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(Value::as_str)
    {
        return match code {
            "authorization_pending" => Ok(PollOutcome::Pending),
            "slow_down" => Ok(PollOutcome::SlowDown),
            _ => Err(Error::DeviceFlow {
                code: code.to_string(),
                description: parsed
                    .as_ref()
                    .and_then(|v| v.get("error_description"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
        };
    }

    if !status.is_success() {
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            body,
        });
    }

    let tokens: TokenResponse = match parsed {
        Some(value) => serde_json::from_value(value)?,
        None => serde_json::from_str(&body)?,
    };
    if tokens.access_token.is_none() {
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            body,
        });
    }
    Ok(PollOutcome::Granted(tokens))
}

fn with_headers(mut request: RequestBuilder, config: &DeviceFlowConfig) -> RequestBuilder {
    request = request.header(reqwest::header::ACCEPT, "application/json");
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}
