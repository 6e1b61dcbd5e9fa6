//! Communication with a Chromium-family browser through its DevTools
//! protocol, plus the lifetime management of the browser process itself.
//!
//! [`Process`] owns one headless browser child for the duration of a grab;
//! [`Passthrough`] reuses an already-running browser instead. [`Browser`]
//! wraps the HTTP side of the DevTools endpoint (`/json/*`) and hands out
//! [`Tab`] handles, which multiplex request/response calls and unsolicited
//! events over a single WebSocket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// Screenshots of tall pages produce very large frames; the transport must
/// never impose a smaller limit than the browser does.
const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Attempts × interval for the DevToolsActivePort file to appear (~20 s).
const PORT_FILE_ATTEMPTS: u32 = 100;
const PORT_FILE_INTERVAL: Duration = Duration::from_millis(200);

/// Start a browser listening on an OS-chosen port, using a throwaway
/// profile directory.
pub struct Process {
    binary: String,
    window_size: (u32, u32),
    child: Option<tokio::process::Child>,
    profile_dir: Option<PathBuf>,
}

impl Process {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            window_size: (1920, 1080),
            child: None,
            profile_dir: None,
        }
    }

    fn chrome_args(&self, profile_dir: &Path) -> Vec<String> {
        vec![
            format!("--window-size={},{}", self.window_size.0, self.window_size.1),
            format!("--user-data-dir={}", profile_dir.display()),
            "--no-default-browser-check".into(),
            "--no-first-run".into(),
            "--disable-breakpad".into(),
            "--disable-extensions".into(),
            "--disable-infobars".into(),
            "--disable-notifications".into(),
            "--disable-background-networking".into(),
            "--safebrowsing-disable-auto-update".into(),
            "--disable-sync".into(),
            "--metrics-recording-only".into(),
            "--disable-default-apps".into(),
            "--disable-background-timer-throttling".into(),
            "--disable-client-side-phishing-detection".into(),
            "--disable-popup-blocking".into(),
            "--disable-prompt-on-repost".into(),
            "--enable-automation".into(),
            "--password-store=basic".into(),
            "--headless".into(),
            "--disable-gpu".into(),
            "--hide-scrollbars".into(),
            "--mute-audio".into(),
            "--remote-debugging-port=0".into(),
            "--homepage=about:blank".into(),
            "about:blank".into(),
        ]
    }

    /// Spawn the browser and wait for it to publish its DevTools port.
    pub async fn acquire(&mut self) -> Result<Url> {
        let profile_dir = tempfile::Builder::new()
            .prefix("crocoite-chrome-userdata-")
            .tempdir()?
            .into_path();

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.chrome_args(&profile_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // new session, so ^C in the controlling terminal does not reach the
        // browser before we tear it down ourselves
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        self.child = Some(child);
        self.profile_dir = Some(profile_dir.clone());

        // the browser writes its active DevTools port into the profile
        let port_file = profile_dir.join("DevToolsActivePort");
        let mut port = None;
        for _ in 0..PORT_FILE_ATTEMPTS {
            if let Ok(contents) = tokio::fs::read_to_string(&port_file).await {
                if let Some(parsed) = contents.lines().next().and_then(|l| l.trim().parse::<u16>().ok()) {
                    port = Some(parsed);
                    break;
                }
            }
            tokio::time::sleep(PORT_FILE_INTERVAL).await;
        }

        match port {
            Some(port) => Url::parse(&format!("http://localhost:{port}"))
                .map_err(|e| Error::Spawn(e.to_string())),
            None => {
                self.release().await;
                Err(Error::Spawn("DevToolsActivePort did not appear".into()))
            }
        }
    }

    /// Terminate the browser and remove its profile directory.
    pub async fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill browser process: {}", e);
            }
            let _ = child.wait().await;
        }

        if let Some(dir) = self.profile_dir.take() {
            // the browser may keep writing into the profile even after
            // wait() returned, retry the removal a few times
            for attempt in 1..=5 {
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => break,
                    Err(e) if attempt == 5 => {
                        warn!("could not remove profile directory {}: {}", dir.display(), e);
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
                }
            }
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // normal teardown goes through release(); this guard covers
        // cancellation, where the grab future is dropped instead and the
        // profile directory would otherwise leak
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        if let Some(dir) = self.profile_dir.take() {
            for attempt in 1..=5 {
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => break,
                    Err(e) if attempt == 5 => {
                        warn!("could not remove profile directory {}: {}", dir.display(), e);
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(200)),
                }
            }
        }
    }
}

/// Use an externally managed browser instead of spawning one.
pub struct Passthrough {
    url: Url,
}

impl Passthrough {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

/// The two ways a grab obtains its DevTools endpoint.
pub enum BrowserService {
    Spawned(Process),
    Remote(Passthrough),
}

impl BrowserService {
    pub async fn acquire(&mut self) -> Result<Url> {
        match self {
            BrowserService::Spawned(process) => process.acquire().await,
            BrowserService::Remote(passthrough) => Ok(passthrough.url.clone()),
        }
    }

    pub async fn release(&mut self) {
        if let BrowserService::Spawned(process) = self {
            process.release().await;
        }
    }
}

/// Tab descriptor as returned by the `/json/list` and `/json/new`
/// endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub web_socket_debugger_url: Option<String>,
}

/// HTTP side of a DevTools endpoint.
#[derive(Clone)]
pub struct Browser {
    url: Url,
    client: reqwest::Client,
}

impl Browser {
    pub fn new(url: Url) -> Self {
        Self { url, client: reqwest::Client::new() }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.url.join(path).map_err(|e| Error::Endpoint(e.to_string()))
    }

    /// All page-type tabs currently open.
    pub async fn list_tabs(&self) -> Result<Vec<TabDescriptor>> {
        let tabs: Vec<TabDescriptor> = self
            .client
            .get(self.endpoint("/json/list")?)
            .send()
            .await?
            .json()
            .await?;
        Ok(tabs.into_iter().filter(|t| t.kind == "page").collect())
    }

    /// Open a fresh tab and attach to it.
    pub async fn new_tab(&self) -> Result<(Tab, TabEvents)> {
        let url = self.endpoint("/json/new")?;
        let response = self.client.get(url.clone()).send().await?;
        // recent browsers insist on PUT for target creation
        let response = if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            self.client.put(url).send().await?
        } else {
            response
        };
        let descriptor: TabDescriptor = response.json().await?;
        let ws_url = descriptor
            .web_socket_debugger_url
            .clone()
            .ok_or_else(|| Error::Endpoint("tab has no webSocketDebuggerUrl".into()))?;
        Tab::connect(&ws_url, descriptor.id).await
    }

    pub async fn close_tab(&self, id: &str) -> Result<()> {
        let body = self
            .client
            .get(self.endpoint(&format!("/json/close/{id}"))?)
            .send()
            .await?
            .text()
            .await?;
        if body != "Target is closing" {
            return Err(Error::Endpoint(format!("unexpected close response: {body}")));
        }
        Ok(())
    }
}

/// Unsolicited frame from the browser, or the crash sentinel.
enum TabEvent {
    Event { method: String, params: Value },
    Crashed(String),
}

struct TabShared {
    msgid: AtomicU64,
    crashed: Mutex<Option<String>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    out: mpsc::UnboundedSender<Message>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl TabShared {
    fn crash(&self, event_tx: &mpsc::UnboundedSender<TabEvent>, reason: &str) {
        if let Ok(mut crashed) = self.crashed.lock() {
            if crashed.is_some() {
                return;
            }
            *crashed = Some(reason.to_string());
        }
        // all pending calls failed, the browser state is lost
        if let Ok(mut pending) = self.pending.lock() {
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(Error::Crashed(reason.to_string())));
            }
        }
        let _ = event_tx.send(TabEvent::Crashed(reason.to_string()));
    }
}

/// Caller half of a tab connection. Cheap to clone; every clone issues
/// calls over the same WebSocket.
#[derive(Clone)]
pub struct Tab {
    pub id: String,
    shared: Arc<TabShared>,
}

/// Event half of a tab connection, consumed by exactly one reader.
pub struct TabEvents {
    rx: mpsc::UnboundedReceiver<TabEvent>,
}

impl TabEvents {
    /// Next unsolicited event as `(method, params)`.
    ///
    /// After connection loss or a target crash this fails with
    /// [`Error::Crashed`], as do all subsequent calls.
    pub async fn next(&mut self) -> Result<(String, Value)> {
        match self.rx.recv().await {
            Some(TabEvent::Event { method, params }) => Ok((method, params)),
            Some(TabEvent::Crashed(reason)) => Err(Error::Crashed(reason)),
            None => Err(Error::Crashed("event stream closed".into())),
        }
    }
}

impl Tab {
    /// Attach to a tab over its WebSocket debugger URL.
    pub async fn connect(ws_url: &str, id: String) -> Result<(Tab, TabEvents)> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_FRAME_SIZE);
        config.max_frame_size = Some(MAX_FRAME_SIZE);
        // no pings: the browser closes the connection on receipt
        let (ws, _) = connect_async_with_config(ws_url, Some(config), false).await?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TabEvent>();

        let shared = Arc::new(TabShared {
            msgid: AtomicU64::new(1),
            crashed: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            out: out_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            loop {
                let text = match stream.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        reader_shared.crash(&event_tx, "connection closed");
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        reader_shared.crash(&event_tx, &e.to_string());
                        return;
                    }
                };
                let frame: Value = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        reader_shared.crash(&event_tx, &format!("undecodable frame: {e}"));
                        return;
                    }
                };
                debug!(frame = %frame, "devtools recv");
                if let Some(id) = frame.get("id").and_then(Value::as_u64) {
                    let tx = reader_shared.pending.lock().ok().and_then(|mut p| p.remove(&id));
                    if let Some(tx) = tx {
                        let result = match frame.get("error") {
                            Some(err) => {
                                let code = err["code"].as_i64().unwrap_or(0);
                                let message = err["message"].as_str().unwrap_or("").to_string();
                                Err(match code {
                                    -32601 => Error::MethodNotFound(message),
                                    -32602 => Error::InvalidParameter(message),
                                    _ => Error::Tab { code, message },
                                })
                            }
                            None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(result);
                    }
                    // a reply nobody waits for is stale, ignore it
                } else if let Some(method) = frame.get("method").and_then(Value::as_str) {
                    if method == "Inspector.targetCrashed" {
                        reader_shared.crash(&event_tx, "target crashed");
                        return;
                    }
                    let params = frame.get("params").cloned().unwrap_or(Value::Null);
                    let _ = event_tx.send(TabEvent::Event { method: method.to_string(), params });
                }
            }
        });

        if let Ok(mut tasks) = shared.tasks.lock() {
            tasks.push(writer.abort_handle());
            tasks.push(reader.abort_handle());
        }

        Ok((Tab { id, shared }, TabEvents { rx: event_rx }))
    }

    /// Issue a DevTools method call and wait for its reply.
    ///
    /// Method names are dotted `Namespace.method` strings; `params` must be
    /// a JSON object.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if let Ok(crashed) = self.shared.crashed.lock() {
            if let Some(reason) = crashed.as_ref() {
                return Err(Error::Crashed(reason.clone()));
            }
        }

        // allocate the id before the first await, ids stay monotonic per
        // caller
        let id = self.shared.msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, tx);
        }
        // re-check: a crash between the first check and the registration
        // would otherwise leave this call waiting forever
        if let Ok(crashed) = self.shared.crashed.lock() {
            if let Some(reason) = crashed.as_ref() {
                if let Ok(mut pending) = self.shared.pending.lock() {
                    pending.remove(&id);
                }
                return Err(Error::Crashed(reason.clone()));
            }
        }

        let frame = json!({ "id": id, "method": method, "params": params });
        debug!(frame = %frame, "devtools send");
        if self.shared.out.send(Message::text(frame.to_string())).is_err() {
            return Err(Error::Crashed("connection closed".into()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Crashed("connection closed".into())),
        }
    }

    /// Tear down the connection tasks. The remote side of the tab is closed
    /// separately through [`Browser::close_tab`].
    pub fn detach(&self) {
        if let Ok(tasks) = self.shared.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal scripted DevTools endpoint speaking just enough of the
    /// protocol for transport tests.
    async fn fake_devtools() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut stream) = ws.split();
            while let Some(Ok(Message::Text(text))) = stream.next().await {
                let frame: Value = serde_json::from_str(&text).unwrap();
                let id = frame["id"].as_u64().unwrap();
                let reply = match frame["method"].as_str().unwrap() {
                    "Network.enable" => json!({"id": id, "result": {}}),
                    "Page.navigate" => {
                        // event delivered ahead of the reply
                        let event = json!({
                            "method": "Page.frameStartedLoading",
                            "params": {"frameId": "F1"},
                        });
                        sink.send(Message::text(event.to_string())).await.unwrap();
                        json!({"id": id, "result": {"frameId": "F1"}})
                    }
                    "Missing.method" => json!({
                        "id": id,
                        "error": {"code": -32601, "message": "'Missing.method' wasn't found"},
                    }),
                    "Page.crash" => {
                        let event = json!({"method": "Inspector.targetCrashed", "params": {}});
                        sink.send(Message::text(event.to_string())).await.unwrap();
                        continue;
                    }
                    other => panic!("unexpected method {other}"),
                };
                sink.send(Message::text(reply.to_string())).await.unwrap();
            }
        });
        (format!("ws://{addr}/devtools/page/test"), server)
    }

    #[tokio::test]
    async fn test_call_reply_and_event_order() {
        let (ws_url, _server) = fake_devtools().await;
        let (tab, mut events) = Tab::connect(&ws_url, "test".into()).await.unwrap();

        let result = tab.call("Network.enable", json!({})).await.unwrap();
        assert_eq!(result, json!({}));

        let nav = tab.call("Page.navigate", json!({"url": "http://example.com/"})).await.unwrap();
        assert_eq!(nav["frameId"], "F1");

        let (method, params) = events.next().await.unwrap();
        assert_eq!(method, "Page.frameStartedLoading");
        assert_eq!(params["frameId"], "F1");
        tab.detach();
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let (ws_url, _server) = fake_devtools().await;
        let (tab, _events) = Tab::connect(&ws_url, "test".into()).await.unwrap();
        match tab.call("Missing.method", json!({})).await {
            Err(Error::MethodNotFound(msg)) => assert!(msg.contains("Missing.method")),
            other => panic!("expected MethodNotFound, got {other:?}"),
        }
        tab.detach();
    }

    #[tokio::test]
    async fn test_target_crash_fans_out() {
        let (ws_url, _server) = fake_devtools().await;
        let (tab, mut events) = Tab::connect(&ws_url, "test".into()).await.unwrap();

        // fire and forget; the reply never comes, only the crash
        let crashing = tab.clone();
        let pending = tokio::spawn(async move { crashing.call("Page.crash", json!({})).await });

        match events.next().await {
            Err(Error::Crashed(_)) => {}
            other => panic!("expected Crashed, got {other:?}"),
        }
        match pending.await.unwrap() {
            Err(Error::Crashed(_)) => {}
            other => panic!("expected pending call to crash, got {other:?}"),
        }
        // subsequent calls fail the same way
        match tab.call("Network.enable", json!({})).await {
            Err(Error::Crashed(_)) => {}
            other => panic!("expected Crashed, got {other:?}"),
        }
        tab.detach();
    }

    #[test]
    fn test_chrome_args() {
        let process = Process::new("chromium");
        let args = process.chrome_args(Path::new("/tmp/profile"));
        assert!(args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.contains(&"--remote-debugging-port=0".to_string()));
        assert!(args.contains(&"--disable-background-networking".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[tokio::test]
    async fn test_passthrough_service() {
        let url = Url::parse("http://localhost:9222").unwrap();
        let mut service = BrowserService::Remote(Passthrough::new(url.clone()));
        assert_eq!(service.acquire().await.unwrap(), url);
        service.release().await;
    }
}
