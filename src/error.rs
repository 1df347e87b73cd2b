//! Error types for oauth-cli

use std::time::Duration;
use thiserror::Error;

/// Result type alias for oauth-cli operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while authenticating against a provider
#[derive(Error, Debug)]
pub enum Error {
    /// No discovery layer could produce a client id
    #[error("Credential discovery failed: {0}")]
    Discovery(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timed out waiting for redirect ({} seconds)", .0.as_secs())]
    Timeout(Duration),

    #[error("Browser was closed before redirect was captured")]
    Cancelled,

    /// The provider's redirect reported an error or carried nothing usable
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Non-success response from a token endpoint
    #[error("Token exchange failed ({status}): {body}")]
    TokenExchange { status: u16, body: String },

    /// Terminal error reported by a device-flow token endpoint
    #[error("Device authorization failed: {code}{}", describe(.description))]
    DeviceFlow {
        code: String,
        description: Option<String>,
    },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" - {}", d))
        .unwrap_or_default()
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<inquire::InquireError> for Error {
    fn from(err: inquire::InquireError) -> Self {
        Error::Prompt(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Browser(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_exchange_message_carries_status_and_body() {
        let err = Error::TokenExchange {
            status: 400,
            body: "invalid_grant".to_string(),
        };
        assert_eq!(err.to_string(), "Token exchange failed (400): invalid_grant");
    }

    #[test]
    fn test_device_flow_message() {
        let err = Error::DeviceFlow {
            code: "access_denied".to_string(),
            description: Some("user said no".to_string()),
        };
        assert_eq!(err.to_string(), "Device authorization failed: access_denied - user said no");

        let bare = Error::DeviceFlow {
            code: "expired_token".to_string(),
            description: None,
        };
        assert_eq!(bare.to_string(), "Device authorization failed: expired_token");
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout(Duration::from_secs(300));
        assert!(err.to_string().contains("300 seconds"));
    }
}
