//! Redirect capture
//!
//! Races the session's detection channels, a liveness check and a deadline.
//! The first channel to see a URL matching the provider's redirect pattern
//! wins; every other future is dropped with the `select!`, which leaves the
//! losing channels without receivers so later matches go nowhere.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use regex::Regex;
use tokio::sync::mpsc;
use url::Url;
use crate::Result;
use crate::error::Error;
use super::{BrowserSession, InterceptedRequest};

/// Parameters delivered by the provider's redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRedirect {
    /// Query and fragment parameters; fragment values win on collision
    pub params: HashMap<String, String>,
    pub redirect_url: String,
}

impl CapturedRedirect {
    /// Parse the query string, then overlay the fragment parsed as a query string
    pub fn parse(redirect_url: &str) -> Result<Self> {
        let url = Url::parse(redirect_url)
            .map_err(|e| Error::Browser(format!("Failed to parse redirect URL: {}", e)))?;

        let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        if let Some(fragment) = url.fragment().filter(|f| !f.is_empty()) {
            params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
        }

        Ok(Self {
            params,
            redirect_url: redirect_url.to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The redirect URL without query or fragment
    ///
    /// This is the redirect URI the provider actually used, which can differ
    /// from the configured one (e.g. a different loopback port).
    pub fn redirect_uri(&self) -> &str {
        let end = self
            .redirect_url
            .find(['?', '#'])
            .unwrap_or(self.redirect_url.len());
        &self.redirect_url[..end]
    }
}

/// Timing for a capture attempt
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub deadline: Duration,
    pub liveness_interval: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            liveness_interval: Duration::from_millis(500),
        }
    }
}

/// Drive `session` to `auth_url` and wait for the first URL matching `pattern`
///
/// Channels are armed before navigation starts so the redirect cannot fire
/// ahead of its observers. Fails with [`Error::Cancelled`] if the browser is
/// closed first and [`Error::Timeout`] if the deadline passes.
pub async fn capture_redirect(
    session: &dyn BrowserSession,
    auth_url: &str,
    pattern: &Regex,
    options: &CaptureOptions,
) -> Result<CapturedRedirect> {
    let channels = session.arm().await?;

    let navigation = async {
        if let Err(e) = session.navigate(auth_url).await {
            tracing::warn!("Navigation to authorization URL reported: {}", e);
        }
        std::future::pending::<Infallible>().await
    };

    let redirect_url = tokio::select! {
        never = navigation => match never {},
        Some(url) = watch_requests(channels.requests, pattern) => {
            tracing::debug!(channel = "network", "Redirect observed");
            url
        }
        Some(url) = watch_interceptions(channels.intercepted, pattern) => {
            tracing::debug!(channel = "interception", "Redirect observed");
            url
        }
        Some(url) = watch_navigations(channels.navigations, session, pattern) => {
            tracing::debug!(channel = "navigation", "Redirect observed");
            url
        }
        _ = browser_closed(session, options.liveness_interval) => {
            return Err(Error::Cancelled);
        }
        _ = tokio::time::sleep(options.deadline) => {
            return Err(Error::Timeout(options.deadline));
        }
    };

    CapturedRedirect::parse(&redirect_url)
}

async fn watch_requests(mut requests: mpsc::UnboundedReceiver<String>, pattern: &Regex) -> Option<String> {
    while let Some(url) = requests.recv().await {
        if pattern.is_match(&url) {
            return Some(url);
        }
    }
    None
}

/// Matching requests are aborted; everything else proceeds untouched
async fn watch_interceptions(
    mut intercepted: mpsc::UnboundedReceiver<InterceptedRequest>,
    pattern: &Regex,
) -> Option<String> {
    while let Some(request) = intercepted.recv().await {
        if pattern.is_match(&request.url) {
            let url = request.url.clone();
            request.abort();
            return Some(url);
        }
        request.proceed();
    }
    None
}

async fn watch_navigations(
    mut navigations: mpsc::UnboundedReceiver<()>,
    session: &dyn BrowserSession,
    pattern: &Regex,
) -> Option<String> {
    while navigations.recv().await.is_some() {
        if let Some(url) = session.current_url().await {
            if pattern.is_match(&url) {
                return Some(url);
            }
        }
    }
    None
}

async fn browser_closed(session: &dyn BrowserSession, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if session.is_closed() {
            return;
        }
    }
}
