//! oauth-cli - capture OAuth2 credentials for AI coding CLIs
//!
//! This library drives authorization-code-with-PKCE flows through a real
//! browser, device-code flows, and plain API-key entry, and stores the
//! resulting credentials in a single JSON file.

pub mod auth;
pub mod browser;
pub mod config;
pub mod error;
pub mod prompt;
pub mod ui;

pub use error::{Error, Result};
