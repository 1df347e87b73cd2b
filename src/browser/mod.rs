//! Interactive browser sessions
//!
//! A [`BrowserSession`] is the source of truth for where the provider sends the
//! user. It exposes three independent detection channels:
//! - every outgoing request seen at the network layer, including ones that
//!   later fail to connect
//! - requests paused before they are sent, each waiting for an
//!   abort/continue decision
//! - top-level navigation events, after which the displayed URL can be read

mod capture;
mod chrome;

pub use capture::{capture_redirect, CaptureOptions, CapturedRedirect};
pub use chrome::{ChromeLauncher, ChromeSession};

use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use crate::Result;

/// What to do with a paused request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptDecision {
    Abort,
    Continue,
}

/// A request held before it is sent
///
/// Dropping it without a decision lets the request continue.
#[derive(Debug)]
pub struct InterceptedRequest {
    pub url: String,
    reply: oneshot::Sender<InterceptDecision>,
}

impl InterceptedRequest {
    pub fn new(url: impl Into<String>) -> (Self, oneshot::Receiver<InterceptDecision>) {
        let (reply, decision) = oneshot::channel();
        (
            Self {
                url: url.into(),
                reply,
            },
            decision,
        )
    }

    pub fn abort(self) {
        let _ = self.reply.send(InterceptDecision::Abort);
    }

    pub fn proceed(self) {
        let _ = self.reply.send(InterceptDecision::Continue);
    }
}

/// Receivers for the three detection channels of an armed session
#[derive(Debug)]
pub struct DetectionChannels {
    pub requests: mpsc::UnboundedReceiver<String>,
    pub intercepted: mpsc::UnboundedReceiver<InterceptedRequest>,
    pub navigations: mpsc::UnboundedReceiver<()>,
}

/// An interactive browser page under our control
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Start all detection channels; must be called before [`navigate`](Self::navigate)
    async fn arm(&self) -> Result<DetectionChannels>;

    /// Begin navigation to `url`
    async fn navigate(&self, url: &str) -> Result<()>;

    /// URL currently displayed, if it can be read
    async fn current_url(&self) -> Option<String>;

    /// Whether the user closed the page or the browser went away
    fn is_closed(&self) -> bool;

    /// Shut the browser down
    async fn close(&self);
}

/// Opens new browser sessions
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>>;
}
