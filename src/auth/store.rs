//! Token storage
//!
//! All captured credentials live in one pretty-printed JSON file mapping
//! provider id to [`TokenRecord`]. Every save rewrites the whole file through
//! a temp file + rename in the same directory, so readers never observe a
//! half-written store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::Result;

/// What kind of secret a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "api_key")]
    ApiKey,
}

/// Credentials captured for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub provider: String,

    #[serde(rename = "type")]
    pub kind: TokenKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Record for a pasted API key
    pub fn api_key(provider: &str, api_key: String) -> Self {
        Self {
            provider: provider.to_string(),
            kind: TokenKind::ApiKey,
            access_token: None,
            id_token: None,
            refresh_token: None,
            api_key: Some(api_key),
            expires_at: None,
            scopes: None,
            token_type: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the record carries an expiry that has passed
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires| Utc::now() >= expires)
    }
}

/// Provider id to record
pub type TokenMap = BTreeMap<String, TokenRecord>;

/// The on-disk token file
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every record; a missing or unreadable file is an empty store
    pub fn load(&self) -> TokenMap {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not read token store {:?}: {}", self.path, e);
                }
                return TokenMap::new();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt token store {:?}: {}", self.path, e);
            TokenMap::new()
        })
    }

    /// Look up one provider's record
    pub fn get_token(&self, provider: &str) -> Option<TokenRecord> {
        self.load().remove(provider)
    }

    /// Replace one provider's record and rewrite the file
    pub fn save_token(&self, provider: &str, record: TokenRecord) -> Result<()> {
        let mut tokens = self.load();
        tokens.insert(provider.to_string(), record);
        self.write(&tokens)
    }

    /// Drop one provider's record; returns whether anything was removed
    pub fn remove_token(&self, provider: &str) -> Result<bool> {
        let mut tokens = self.load();
        if tokens.remove(provider).is_none() {
            return Ok(false);
        }
        self.write(&tokens)?;
        Ok(true)
    }

    fn write(&self, tokens: &TokenMap) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tokens.json".to_string());
        let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let content = serde_json::to_string_pretty(tokens)?;
        std::fs::write(&tmp_path, content)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp_path, perms)?;
        }

        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        tracing::debug!("Wrote {} record(s) to {:?}", tokens.len(), self.path);
        Ok(())
    }
}
