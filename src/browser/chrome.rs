//! Chrome session driven over the DevTools protocol
//!
//! Launches a visible Chrome/Chromium with a throw-away profile, connects to
//! its DevTools WebSocket and attaches to a single page. The three detection
//! channels map onto protocol events:
//! - `Network.requestWillBeSent` for every outgoing request
//! - `Fetch.requestPaused` for interception (answered with
//!   `Fetch.failRequest` or `Fetch.continueRequest`)
//! - `Page.frameNavigated` for top-level navigations

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};
use crate::Result;
use crate::config::BrowserConfig;
use crate::error::Error;
use super::{
    BrowserLauncher, BrowserSession, DetectionChannels, InterceptDecision, InterceptedRequest,
};

/// How long a single DevTools command may take
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Hides the most obvious automation marker from sign-in pages
const STEALTH_SCRIPT: &str = "Object.defineProperty(navigator, 'webdriver', { get: () => false });";

/// Launches [`ChromeSession`]s with a fixed configuration
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>> {
        Ok(Arc::new(ChromeSession::launch(&self.config).await?))
    }
}

type Reply = std::result::Result<Value, String>;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Event senders installed when the session is armed
#[derive(Default)]
struct Listeners {
    requests: Option<mpsc::UnboundedSender<String>>,
    intercepted: Option<mpsc::UnboundedSender<InterceptedRequest>>,
    navigations: Option<mpsc::UnboundedSender<()>>,
}

/// State shared between the session and the socket reader task
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    listeners: Mutex<Listeners>,
    target_id: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outgoing half of a DevTools connection
#[derive(Clone)]
struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

impl Connection {
    fn encode(&self, method: &str, params: Value, session_id: Option<&str>) -> (u64, String) {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        (id, message.to_string())
    }

    /// Send a command and wait for its result
    async fn call(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        let (id, message) = self.encode(method, params, session_id);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        if self.outgoing.send(message).is_err() {
            lock(&self.shared.pending).remove(&id);
            return Err(Error::Browser("DevTools connection closed".to_string()));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(Error::Browser(format!("{} failed: {}", method, message))),
            Ok(Err(_)) => Err(Error::Browser("DevTools connection closed".to_string())),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                Err(Error::Browser(format!("{} timed out", method)))
            }
        }
    }

    /// Send a command without waiting for the result
    fn notify(&self, method: &str, params: Value, session_id: Option<&str>) {
        let (_, message) = self.encode(method, params, session_id);
        if self.outgoing.send(message).is_err() {
            debug!("Dropped {} on closed DevTools connection", method);
        }
    }

    fn page_session(&self) -> Option<String> {
        lock(&self.shared.session_id).clone()
    }
}

/// Throw-away browser profile directory, removed when dropped
struct ProfileDir(PathBuf);

impl ProfileDir {
    async fn create() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("oauth-cli-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.0) {
            Ok(()) => debug!("Removed profile {:?}", self.0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove profile {:?}: {}", self.0, e),
        }
    }
}

/// A visible Chrome window with one attached page
///
/// Dropping the session without [`close`](BrowserSession::close) still kills
/// the browser and removes its profile.
pub struct ChromeSession {
    connection: Connection,
    session_id: String,
    target_id: String,
    child: tokio::sync::Mutex<Option<Child>>,
    profile_dir: ProfileDir,
}

impl ChromeSession {
    /// Launch Chrome and attach to its first page
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let executable = find_browser(config.executable.as_deref()).await?;
        let profile_dir = ProfileDir::create().await?;

        info!("Launching browser {:?}", executable);
        let mut child = tokio::process::Command::new(&executable)
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", profile_dir.path().display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-blink-features=AutomationControlled")
            .args(&config.extra_args)
            .arg("about:blank")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Browser(format!("Failed to launch {:?}: {}", executable, e)))?;

        let timeout = Duration::from_secs(config.launch_timeout_secs);
        let ws_url = wait_for_devtools(profile_dir.path(), &mut child, timeout).await?;
        debug!("DevTools endpoint: {}", ws_url);

        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;
        let connection = spawn_connection(ws_stream);

        let (target_id, session_id) = attach_page(&connection).await?;
        *lock(&connection.shared.target_id) = Some(target_id.clone());
        *lock(&connection.shared.session_id) = Some(session_id.clone());

        let page = Some(session_id.as_str());
        connection.call("Page.enable", json!({}), page).await?;
        connection
            .call(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": STEALTH_SCRIPT }),
                page,
            )
            .await?;

        Ok(Self {
            connection,
            session_id,
            target_id,
            child: tokio::sync::Mutex::new(Some(child)),
            profile_dir,
        })
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn arm(&self) -> Result<DetectionChannels> {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (intercepted_tx, intercepted) = mpsc::unbounded_channel();
        let (navigations_tx, navigations) = mpsc::unbounded_channel();

        {
            let mut listeners = lock(&self.connection.shared.listeners);
            listeners.requests = Some(requests_tx);
            listeners.intercepted = Some(intercepted_tx);
            listeners.navigations = Some(navigations_tx);
        }

        let page = Some(self.session_id.as_str());
        self.connection.call("Network.enable", json!({}), page).await?;
        self.connection
            .call(
                "Fetch.enable",
                json!({ "patterns": [{ "urlPattern": "*", "requestStage": "Request" }] }),
                page,
            )
            .await?;

        Ok(DetectionChannels {
            requests,
            intercepted,
            navigations,
        })
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let result = self
            .connection
            .call("Page.navigate", json!({ "url": url }), Some(self.session_id.as_str()))
            .await?;

        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            // Expected when the page redirects straight to an aborted callback
            debug!("Navigation ended with {}", error);
        }
        Ok(())
    }

    async fn current_url(&self) -> Option<String> {
        let result = self
            .connection
            .call("Target.getTargetInfo", json!({ "targetId": self.target_id }), None)
            .await
            .ok()?;
        result["targetInfo"]["url"].as_str().map(str::to_string)
    }

    fn is_closed(&self) -> bool {
        self.connection.shared.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.is_closed() {
            let closing = self.connection.call("Browser.close", json!({}), None);
            if tokio::time::timeout(Duration::from_secs(2), closing).await.is_err() {
                debug!("Browser.close did not answer in time");
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Browser process already gone: {}", e);
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(self.profile_dir.path()).await {
            debug!("Could not remove profile {:?}: {}", self.profile_dir.path(), e);
        }
    }
}

/// Locate a Chrome or Chromium binary
async fn find_browser(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Browser(format!("Configured browser not found: {:?}", path)));
    }

    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser", "chrome"] {
        let output = tokio::process::Command::new("which").arg(name).output().await;
        if let Ok(output) = output {
            if output.status.success() {
                let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
                if path.exists() {
                    return Ok(path);
                }
            }
        }
    }

    let common_paths = [
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/snap/bin/chromium"),
    ];

    common_paths
        .into_iter()
        .find(|path| path.exists())
        .ok_or_else(|| {
            Error::Browser(
                "Chrome or Chromium not found. Install one or set browser.executable in the config."
                    .to_string(),
            )
        })
}

/// Wait for Chrome to write `DevToolsActivePort` and build the WebSocket URL
async fn wait_for_devtools(profile_dir: &Path, child: &mut Child, timeout: Duration) -> Result<String> {
    let port_file = profile_dir.join("DevToolsActivePort");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(content) = tokio::fs::read_to_string(&port_file).await {
            if let Some(url) = parse_active_port(&content) {
                return Ok(url);
            }
        }

        if let Ok(Some(status)) = child.try_wait() {
            return Err(Error::Browser(format!("Browser exited during startup ({})", status)));
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Browser(format!(
                "Browser did not expose DevTools within {} seconds",
                timeout.as_secs()
            )));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// `DevToolsActivePort` holds the port on line one and the browser path on line two
fn parse_active_port(content: &str) -> Option<String> {
    let mut lines = content.lines();
    let port: u16 = lines.next()?.trim().parse().ok()?;
    let path = lines.next()?.trim();
    if path.is_empty() {
        return None;
    }
    Some(format!("ws://127.0.0.1:{}{}", port, path))
}

/// Find or create a page target and attach to it with a flat session
async fn attach_page(connection: &Connection) -> Result<(String, String)> {
    connection
        .call("Target.setDiscoverTargets", json!({ "discover": true }), None)
        .await?;

    let targets = connection.call("Target.getTargets", json!({}), None).await?;
    let existing = targets["targetInfos"]
        .as_array()
        .and_then(|infos| infos.iter().find(|info| info["type"] == "page"))
        .and_then(|info| info["targetId"].as_str())
        .map(str::to_string);

    let target_id = match existing {
        Some(id) => id,
        None => {
            let created = connection
                .call("Target.createTarget", json!({ "url": "about:blank" }), None)
                .await?;
            created["targetId"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Browser("createTarget returned no targetId".to_string()))?
        }
    };

    let attached = connection
        .call(
            "Target.attachToTarget",
            json!({ "targetId": target_id, "flatten": true }),
            None,
        )
        .await?;
    let session_id = attached["sessionId"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Browser("attachToTarget returned no sessionId".to_string()))?;

    Ok((target_id, session_id))
}

/// Split the socket into a writer task and a reader task
fn spawn_connection(ws_stream: WsStream) -> Connection {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outgoing, mut rx) = mpsc::unbounded_channel::<String>();
    let shared = Arc::new(Shared::default());
    let connection = Connection { outgoing, shared };

    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(text.into())).await.is_err() {
                debug!("DevTools socket closed while sending");
                break;
            }
        }
    });

    let reader = connection.clone();
    tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => dispatch(&reader, value),
                    Err(e) => debug!("Unparseable DevTools message: {}", e),
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("DevTools socket error: {}", e);
                    break;
                }
            }
        }

        info!("Browser connection closed");
        mark_closed(&reader.shared);
    });

    connection
}

/// Flag the session closed and release everything waiting on it
fn mark_closed(shared: &Shared) {
    shared.closed.store(true, Ordering::SeqCst);
    lock(&shared.pending).clear();
    *lock(&shared.listeners) = Listeners::default();
}

/// Route a response to its caller or an event to the matching channel
fn dispatch(connection: &Connection, message: Value) {
    let shared = &connection.shared;

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        if let Some(reply) = lock(&shared.pending).remove(&id) {
            let result = match message.get("error") {
                Some(error) => Err(error["message"].as_str().unwrap_or("unknown error").to_string()),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = reply.send(result);
        }
        return;
    }

    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return;
    };
    let params = &message["params"];

    match method {
        "Network.requestWillBeSent" => {
            if let Some(url) = params["request"]["url"].as_str() {
                if let Some(tx) = &lock(&shared.listeners).requests {
                    let _ = tx.send(url.to_string());
                }
            }
        }
        "Fetch.requestPaused" => on_request_paused(connection, params),
        "Page.frameNavigated" => {
            // Only the top-level frame changes what the user sees
            if params["frame"].get("parentId").is_none() {
                if let Some(tx) = &lock(&shared.listeners).navigations {
                    let _ = tx.send(());
                }
            }
        }
        "Target.targetDestroyed" | "Target.detachedFromTarget" => {
            let target = params["targetId"].as_str();
            let watched = lock(&shared.target_id).clone();
            let session = params["sessionId"].as_str();
            let attached = lock(&shared.session_id).clone();
            if (target.is_some() && target == watched.as_deref())
                || (session.is_some() && session == attached.as_deref())
            {
                info!("Browser page was closed");
                mark_closed(shared);
            }
        }
        "Inspector.detached" => mark_closed(shared),
        _ => {}
    }
}

/// Hand a paused request to the interception channel and relay its decision
fn on_request_paused(connection: &Connection, params: &Value) {
    let Some(request_id) = params["requestId"].as_str().map(str::to_string) else {
        return;
    };
    let url = params["request"]["url"].as_str().unwrap_or_default();
    let session_id = connection.page_session();

    let (request, decision) = InterceptedRequest::new(url);
    let delivered = match &lock(&connection.shared.listeners).intercepted {
        Some(tx) => tx.send(request).is_ok(),
        None => false,
    };

    if !delivered {
        connection.notify(
            "Fetch.continueRequest",
            json!({ "requestId": request_id }),
            session_id.as_deref(),
        );
        return;
    }

    let connection = connection.clone();
    tokio::spawn(async move {
        match decision.await {
            Ok(InterceptDecision::Abort) => connection.notify(
                "Fetch.failRequest",
                json!({ "requestId": request_id, "errorReason": "Aborted" }),
                session_id.as_deref(),
            ),
            // A dropped decision means nobody cares any more; let it through
            Ok(InterceptDecision::Continue) | Err(_) => connection.notify(
                "Fetch.continueRequest",
                json!({ "requestId": request_id }),
                session_id.as_deref(),
            ),
        }
    });
}
