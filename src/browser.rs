//! Site loading: turns the raw DevTools event stream of one tab into a
//! stream of archival events.
//!
//! The collector correlates `Network.*` events into complete
//! [`RequestResponsePair`]s — across redirects, request-id reuse and body
//! prefetch round-trips — and tracks per-frame loading state so the
//! controller can detect page idleness.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use url::Url;

use crate::controller::Event;
use crate::devtools::{Browser, Tab, TabEvents};
use crate::error::{Error, Result};
use crate::logger::{Level, Logger};

/// Response payload bytes, tagged with how the browser delivered them.
///
/// `Unicode` marks text the browser has already transcoded to UTF-8,
/// `Base64` marks opaque bytes. Equality compares the raw bytes only; the
/// tag merely affects how downstream consumers annotate the content type.
#[derive(Debug, Clone, Eq)]
pub enum Body {
    Unicode(Vec<u8>),
    Base64(Vec<u8>),
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Unicode(bytes) | Body::Base64(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn is_unicode(&self) -> bool {
        matches!(self, Body::Unicode(_))
    }
}

impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// Case-insensitive multi-valued header map preserving insertion order.
///
/// The browser folds repeated source headers into one value joined with
/// newlines; [`Headers::from_cdp`] splits those back into separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cdp(headers: &Value) -> Self {
        let mut result = Headers::new();
        if let Some(map) = headers.as_object() {
            for (name, value) in map {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                for part in text.split('\n') {
                    result.push(name.clone(), part.to_string());
                }
            }
        }
        result
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for a name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn replace(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resource classification reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    TextTrack,
    Xhr,
    Fetch,
    EventSource,
    WebSocket,
    Manifest,
    Other,
}

impl ResourceType {
    pub fn from_cdp(name: &str) -> Self {
        match name {
            "Document" => ResourceType::Document,
            "Stylesheet" => ResourceType::Stylesheet,
            "Image" => ResourceType::Image,
            "Media" => ResourceType::Media,
            "Font" => ResourceType::Font,
            "Script" => ResourceType::Script,
            "TextTrack" => ResourceType::TextTrack,
            "XHR" => ResourceType::Xhr,
            "Fetch" => ResourceType::Fetch,
            "EventSource" => ResourceType::EventSource,
            "WebSocket" => ResourceType::WebSocket,
            "Manifest" => ResourceType::Manifest,
            _ => ResourceType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "Document",
            ResourceType::Stylesheet => "Stylesheet",
            ResourceType::Image => "Image",
            ResourceType::Media => "Media",
            ResourceType::Font => "Font",
            ResourceType::Script => "Script",
            ResourceType::TextTrack => "TextTrack",
            ResourceType::Xhr => "XHR",
            ResourceType::Fetch => "Fetch",
            ResourceType::EventSource => "EventSource",
            ResourceType::WebSocket => "WebSocket",
            ResourceType::Manifest => "Manifest",
            ResourceType::Other => "Other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub headers: Headers,
    pub body: Option<Body>,
    /// The browser reported a body that may need a second round-trip.
    pub has_post_data: bool,
    pub initiator: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub status_text: Option<String>,
    pub headers: Headers,
    pub body: Option<Body>,
    pub mime_type: Option<String>,
    /// Wire size so far, not body size.
    pub bytes_received: u64,
    pub timestamp: DateTime<Utc>,
    /// Body could not (redirect) or can not (prefetch failure) be recorded.
    pub truncated: bool,
    pub from_disk_cache: Option<bool>,
    pub connection_reused: Option<bool>,
}

/// The unit of capture: one request observed by the browser together with
/// its response, if any. A pair without a response represents a load
/// failure.
#[derive(Debug, Clone)]
pub struct RequestResponsePair {
    /// Request id assigned by the browser. Reused across redirects.
    pub id: String,
    pub url: Url,
    pub request: Request,
    pub response: Option<Response>,
    pub remote_address: Option<String>,
    pub protocol: Option<String>,
    pub resource_type: Option<ResourceType>,
}

/// Root frame navigation notification.
#[derive(Debug, Clone)]
pub struct FrameNavigated {
    pub frame_id: String,
    pub url: Url,
    pub mime_type: Option<String>,
}

/// Reference point translating the browser's monotonic event timestamps
/// into absolute wall-clock time, captured from the first request event of
/// a pair.
#[derive(Debug, Clone, Copy)]
struct TimeRef {
    monotonic: f64,
    wall: DateTime<Utc>,
}

impl TimeRef {
    fn at(&self, monotonic: f64) -> DateTime<Utc> {
        let delta = monotonic - self.monotonic;
        let delta = if delta.is_finite() { delta.max(0.0) } else { 0.0 };
        let delta = chrono::Duration::from_std(Duration::from_secs_f64(delta))
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + delta
    }
}

fn wall_time(epoch_seconds: f64) -> DateTime<Utc> {
    let secs = epoch_seconds.floor();
    let nanos = ((epoch_seconds - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos).unwrap_or_default()
}

struct PendingPair {
    pair: RequestResponsePair,
    reference: TimeRef,
}

/// What the loader must do in response to one browser event.
pub(crate) enum Action {
    Emit(Event),
    Fetch {
        pair: RequestResponsePair,
        /// Redirect pairs must not fetch the response body: the id has been
        /// reused and the browser would return the follow-up's body.
        fetch_response_body: bool,
    },
    AnswerDialog {
        accept: bool,
    },
}

/// Pure collector state machine. Separated from [`SiteLoader`] so the
/// event handling can be exercised without a live browser.
pub(crate) struct CollectorState {
    in_flight: HashMap<String, PendingPair>,
    frames_loading: HashSet<String>,
    root_frame: Option<String>,
    logger: Logger,
}

impl CollectorState {
    fn new(logger: Logger) -> Self {
        Self {
            in_flight: HashMap::new(),
            frames_loading: HashSet::new(),
            root_frame: None,
            logger,
        }
    }

    fn set_root_frame(&mut self, frame_id: String) {
        self.root_frame = Some(frame_id);
    }

    fn handle(&mut self, method: &str, params: &Value) -> Vec<Action> {
        match method {
            "Network.requestWillBeSent" => self.request_will_be_sent(params),
            "Network.responseReceived" => self.response_received(params),
            "Network.loadingFinished" => self.loading_finished(params),
            "Network.loadingFailed" => self.loading_failed(params),
            "Page.frameStartedLoading" => self.frame_started_loading(params),
            "Page.frameStoppedLoading" => self.frame_stopped_loading(params),
            "Page.frameNavigated" => self.frame_navigated(params),
            "Page.javascriptDialogOpening" => self.javascript_dialog_opening(params),
            "Log.entryAdded" => self.entry_added(params),
            _ => Vec::new(),
        }
    }

    fn request_will_be_sent(&mut self, params: &Value) -> Vec<Action> {
        let Some(id) = params["requestId"].as_str() else { return Vec::new() };
        let request_data = &params["request"];
        // filter before anything is allocated for this request
        let url = match request_data["url"].as_str().and_then(|u| Url::parse(u).ok()) {
            Some(url) if matches!(url.scheme(), "http" | "https") => url,
            Some(url) => {
                self.logger.debug(
                    "ignoring scheme",
                    json!({
                        "uuid": "8d9e4f29-1b09-4e45-b2bf-9f49a2ad0a4e",
                        "scheme": url.scheme(),
                    }),
                );
                return Vec::new();
            }
            None => return Vec::new(),
        };

        let mut actions = Vec::new();
        if let Some(mut existing) = self.in_flight.remove(id) {
            // redirects never finish loading, they yield another
            // requestWillBeSent with the same id and a redirectResponse
            match params.get("redirectResponse").filter(|v| !v.is_null()) {
                Some(redirect) => {
                    let monotonic = params["timestamp"]
                        .as_f64()
                        .unwrap_or(existing.reference.monotonic);
                    let mut response = response_from_cdp(redirect, monotonic, &existing.reference);
                    response.truncated = true;
                    if let Some(address) = redirect["remoteIPAddress"].as_str() {
                        existing.pair.remote_address = Some(address.to_string());
                    }
                    if let Some(protocol) = redirect["protocol"].as_str() {
                        existing.pair.protocol = Some(protocol.to_string());
                    }
                    existing.pair.response = Some(response);
                    self.logger.info(
                        "redirect",
                        json!({
                            "uuid": "f8c27cfb-e527-4b95-9180-aef411f7a7cc",
                            "id": id,
                            "url": url.as_str(),
                        }),
                    );
                    actions.push(Action::Fetch {
                        pair: existing.pair,
                        fetch_response_body: false,
                    });
                }
                None => {
                    self.logger.warning(
                        "request exists, overwriting",
                        json!({
                            "uuid": "9acbca2a-9647-4ae1-91cd-ba5ae86bb52c",
                            "id": id,
                        }),
                    );
                }
            }
        }

        let reference = TimeRef {
            monotonic: params["timestamp"].as_f64().unwrap_or(0.0),
            wall: wall_time(params["wallTime"].as_f64().unwrap_or(0.0)),
        };
        let request = Request {
            method: request_data["method"].as_str().unwrap_or("GET").to_string(),
            headers: Headers::from_cdp(&request_data["headers"]),
            body: request_data["postData"]
                .as_str()
                .map(|data| Body::Unicode(data.as_bytes().to_vec())),
            has_post_data: request_data["hasPostData"].as_bool().unwrap_or(false),
            initiator: params.get("initiator").cloned(),
            timestamp: reference.wall,
        };
        let pair = RequestResponsePair {
            id: id.to_string(),
            url,
            request,
            response: None,
            remote_address: None,
            protocol: None,
            resource_type: params["type"].as_str().map(ResourceType::from_cdp),
        };
        self.in_flight.insert(id.to_string(), PendingPair { pair, reference });
        actions
    }

    fn response_received(&mut self, params: &Value) -> Vec<Action> {
        let Some(id) = params["requestId"].as_str() else { return Vec::new() };
        let Some(pending) = self.in_flight.get_mut(id) else { return Vec::new() };

        let response_data = &params["response"];
        if response_data["url"].as_str() != Some(pending.pair.url.as_str()) {
            self.logger.warning(
                "response url mismatch",
                json!({
                    "uuid": "7a0b5c3b-5f52-4a1c-94ef-0a3fdb0f1bbd",
                    "id": id,
                    "expected": pending.pair.url.as_str(),
                    "got": response_data["url"].as_str(),
                }),
            );
            return Vec::new();
        }

        let monotonic = params["timestamp"].as_f64().unwrap_or(pending.reference.monotonic);
        pending.pair.remote_address = response_data["remoteIPAddress"].as_str().map(str::to_string);
        pending.pair.protocol = response_data["protocol"].as_str().map(str::to_string);
        pending.pair.response = Some(response_from_cdp(response_data, monotonic, &pending.reference));
        Vec::new()
    }

    fn loading_finished(&mut self, params: &Value) -> Vec<Action> {
        let Some(id) = params["requestId"].as_str() else { return Vec::new() };
        // unknown ids were dropped at the scheme filter
        let Some(mut pending) = self.in_flight.remove(id) else { return Vec::new() };

        match pending.pair.response.as_mut() {
            Some(response) => {
                response.bytes_received = params["encodedDataLength"]
                    .as_u64()
                    .or_else(|| params["encodedDataLength"].as_f64().map(|v| v as u64))
                    .unwrap_or(response.bytes_received);
                vec![Action::Fetch { pair: pending.pair, fetch_response_body: true }]
            }
            // finished without a responseReceived: nothing to prefetch
            None => vec![Action::Emit(Event::Pair(pending.pair))],
        }
    }

    fn loading_failed(&mut self, params: &Value) -> Vec<Action> {
        let Some(id) = params["requestId"].as_str() else { return Vec::new() };
        let Some(mut pending) = self.in_flight.remove(id) else { return Vec::new() };

        self.logger.warning(
            "loading failed",
            json!({
                "uuid": "4a9cbf25-a9e5-4fbe-b3ef-9c0f29251a2c",
                "id": id,
                "errorText": params["errorText"].as_str(),
                "blockedReason": params["blockedReason"].as_str(),
            }),
        );
        pending.pair.response = None;
        vec![Action::Emit(Event::Pair(pending.pair))]
    }

    fn frame_started_loading(&mut self, params: &Value) -> Vec<Action> {
        let Some(frame_id) = params["frameId"].as_str() else { return Vec::new() };
        let was_idle = self.frames_loading.is_empty();
        self.frames_loading.insert(frame_id.to_string());
        if was_idle {
            vec![Action::Emit(Event::PageIdle(false))]
        } else {
            Vec::new()
        }
    }

    fn frame_stopped_loading(&mut self, params: &Value) -> Vec<Action> {
        let Some(frame_id) = params["frameId"].as_str() else { return Vec::new() };
        if self.frames_loading.remove(frame_id) && self.frames_loading.is_empty() {
            vec![Action::Emit(Event::PageIdle(true))]
        } else {
            Vec::new()
        }
    }

    fn frame_navigated(&mut self, params: &Value) -> Vec<Action> {
        let frame = &params["frame"];
        let Some(frame_id) = frame["id"].as_str() else { return Vec::new() };
        if Some(frame_id) != self.root_frame.as_deref() {
            return Vec::new();
        }
        let Some(url) = frame["url"].as_str().and_then(|u| Url::parse(u).ok()) else {
            return Vec::new();
        };
        vec![Action::Emit(Event::FrameNavigated(FrameNavigated {
            frame_id: frame_id.to_string(),
            url,
            mime_type: frame["mimeType"].as_str().map(str::to_string),
        }))]
    }

    fn javascript_dialog_opening(&mut self, params: &Value) -> Vec<Action> {
        let kind = params["type"].as_str().unwrap_or("");
        match kind {
            "beforeunload" => {
                // must accept, otherwise the page cannot unload
                self.logger.info(
                    "javascript dialog",
                    json!({
                        "uuid": "3ef7292e-8595-4e89-b834-0cc6bc40ee38",
                        "type": kind,
                        "message": params["message"].as_str(),
                        "action": "proceeding",
                    }),
                );
                vec![Action::AnswerDialog { accept: true }]
            }
            "alert" | "confirm" | "prompt" => {
                self.logger.info(
                    "javascript dialog",
                    json!({
                        "uuid": "fa872de9-7603-4d68-8444-4c05a9d6dff8",
                        "type": kind,
                        "message": params["message"].as_str(),
                        "action": "canceling",
                    }),
                );
                vec![Action::AnswerDialog { accept: false }]
            }
            _ => {
                self.logger.warning(
                    "unknown javascript dialog type",
                    json!({
                        "uuid": "a3a3e4cf-9a69-458e-92b2-0b02c9bea9c3",
                        "type": kind,
                    }),
                );
                Vec::new()
            }
        }
    }

    fn entry_added(&mut self, params: &Value) -> Vec<Action> {
        let entry = &params["entry"];
        let level = match entry["level"].as_str() {
            Some("verbose") => Level::Debug,
            Some("info") => Level::Info,
            Some("warning") => Level::Warning,
            _ => Level::Error,
        };
        self.logger.log(
            level,
            "console",
            json!({
                "uuid": "bc96eb68-29b7-41b6-a1a5-d5a57904ee77",
                "source": entry["source"].as_str(),
                "text": entry["text"].as_str(),
            }),
        );
        Vec::new()
    }
}

fn response_from_cdp(response: &Value, monotonic: f64, reference: &TimeRef) -> Response {
    Response {
        status: response["status"].as_u64().unwrap_or(0) as u16,
        status_text: response["statusText"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        headers: Headers::from_cdp(&response["headers"]),
        body: None,
        mime_type: response["mimeType"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        bytes_received: response["encodedDataLength"]
            .as_u64()
            .or_else(|| response["encodedDataLength"].as_f64().map(|v| v as u64))
            .unwrap_or(0),
        timestamp: reference.at(monotonic),
        truncated: false,
        from_disk_cache: response["fromDiskCache"].as_bool(),
        connection_reused: response["connectionReused"].as_bool(),
    }
}

async fn fetch_bodies(
    tab: Tab,
    logger: Logger,
    mut pair: RequestResponsePair,
    fetch_response_body: bool,
) -> RequestResponsePair {
    if pair.request.body.is_none() && pair.request.has_post_data {
        match tab.call("Network.getRequestPostData", json!({"requestId": pair.id})).await {
            Ok(result) => {
                let data = result["postData"].as_str().unwrap_or("");
                match BASE64.decode(data) {
                    Ok(bytes) => pair.request.body = Some(Body::Base64(bytes)),
                    Err(e) => logger.warning(
                        "cannot decode request body",
                        json!({
                            "uuid": "03e1a4a6-a1b1-4a04-88ec-8bb016e5d4c9",
                            "id": pair.id,
                            "error": e.to_string(),
                        }),
                    ),
                }
            }
            Err(e) => logger.warning(
                "cannot fetch request body",
                json!({
                    "uuid": "ee9adc58-0b55-4bf6-9676-1941fba82cf0",
                    "id": pair.id,
                    "error": e.to_string(),
                }),
            ),
        }
    }

    if fetch_response_body {
        if let Some(response) = pair.response.as_mut() {
            match tab.call("Network.getResponseBody", json!({"requestId": pair.id})).await {
                Ok(result) => {
                    let raw = result["body"].as_str().unwrap_or("");
                    if result["base64Encoded"].as_bool().unwrap_or(false) {
                        match BASE64.decode(raw) {
                            Ok(bytes) => response.body = Some(Body::Base64(bytes)),
                            Err(_) => response.truncated = true,
                        }
                    } else {
                        response.body = Some(Body::Unicode(raw.as_bytes().to_vec()));
                    }
                }
                Err(e) => {
                    response.truncated = true;
                    logger.warning(
                        "cannot fetch response body",
                        json!({
                            "uuid": "78ea6eae-989c-44cd-a62a-a8b1e2e54c8b",
                            "id": pair.id,
                            "error": e.to_string(),
                        }),
                    );
                }
            }
        }
    }

    pair
}

/// Load a site in one browser tab and monitor its network requests.
///
/// The loader exposes a lazy, single-consumer sequence of [`Event`]s via
/// [`SiteLoader::next`]; producing an item may suspend. Dropping the loader
/// cancels every background prefetch and closes the tab.
pub struct SiteLoader {
    browser: Browser,
    pub tab: Tab,
    events: TabEvents,
    state: CollectorState,
    ready: VecDeque<Event>,
    background: JoinSet<Option<RequestResponsePair>>,
    logger: Logger,
    closed: bool,
}

impl SiteLoader {
    /// Open a fresh tab, enable the required DevTools domains and reset
    /// cache and cookies.
    pub async fn attach(browser: Browser, logger: &Logger) -> Result<Self> {
        let logger = logger.bind(json!({"context": "SiteLoader"}));
        let (tab, events) = browser.new_tab().await?;

        for method in ["Log.enable", "Network.enable", "Page.enable", "Inspector.enable"] {
            tab.call(method, json!({})).await?;
        }
        tab.call("Network.clearBrowserCache", json!({})).await?;
        let can_clear = tab.call("Network.canClearBrowserCookies", json!({})).await?;
        if can_clear["result"].as_bool().unwrap_or(false) {
            tab.call("Network.clearBrowserCookies", json!({})).await?;
        }

        Ok(Self {
            browser,
            tab,
            events,
            state: CollectorState::new(logger.clone()),
            ready: VecDeque::new(),
            background: JoinSet::new(),
            logger,
            closed: false,
        })
    }

    /// Start navigating the tab. Fails with [`Error::Navigate`] when the
    /// browser rejects the navigation.
    pub async fn navigate(&mut self, url: &Url) -> Result<()> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(url.to_string()));
        }
        let result = self.tab.call("Page.navigate", json!({"url": url.as_str()})).await?;
        if let Some(text) = result["errorText"].as_str().filter(|t| !t.is_empty()) {
            return Err(Error::Navigate(text.to_string()));
        }
        if let Some(frame_id) = result["frameId"].as_str() {
            self.state.set_root_frame(frame_id.to_string());
        }
        Ok(())
    }

    /// Next archival event. Pairs are produced once their bodies have been
    /// prefetched or loading failed; a crash of the underlying tab
    /// surfaces as [`Error::Crashed`].
    pub async fn next(&mut self) -> Result<Event> {
        enum Step {
            Finished(std::result::Result<Option<RequestResponsePair>, tokio::task::JoinError>),
            Incoming(String, Value),
        }

        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(event);
            }

            let step = tokio::select! {
                Some(joined) = self.background.join_next() => {
                    Step::Finished(joined)
                }
                incoming = self.events.next() => {
                    let (method, params) = incoming?;
                    Step::Incoming(method, params)
                }
            };

            match step {
                Step::Finished(Ok(Some(pair))) => return Ok(Event::Pair(pair)),
                Step::Finished(Ok(None)) => {}
                Step::Finished(Err(e)) if e.is_cancelled() => {}
                Step::Finished(Err(e)) => {
                    self.logger.error(
                        "background task failed",
                        json!({
                            "uuid": "fb3f79e3-04a0-4e43-a4b8-3e3b0ec8ba92",
                            "error": e.to_string(),
                        }),
                    );
                }
                Step::Incoming(method, params) => {
                    for action in self.state.handle(&method, &params) {
                        self.apply(action);
                    }
                }
            }
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Emit(event) => self.ready.push_back(event),
            Action::Fetch { pair, fetch_response_body } => {
                let tab = self.tab.clone();
                let logger = self.logger.clone();
                self.background.spawn(async move {
                    Some(fetch_bodies(tab, logger, pair, fetch_response_body).await)
                });
            }
            Action::AnswerDialog { accept } => {
                let tab = self.tab.clone();
                self.background.spawn(async move {
                    let _ = tab
                        .call("Page.handleJavaScriptDialog", json!({"accept": accept}))
                        .await;
                    None
                });
            }
        }
    }

    /// Cancel background work and close the tab.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.background.abort_all();
        if let Err(e) = self.browser.close_tab(&self.tab.id).await {
            self.logger.warning(
                "closing tab failed",
                json!({
                    "uuid": "2c8bba87-9183-438f-92a7-6425b7ba3e19",
                    "error": e.to_string(),
                }),
            );
        }
        self.tab.detach();
    }
}

impl Drop for SiteLoader {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.tab.detach();
        let browser = self.browser.clone();
        let id = self.tab.id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = browser.close_tab(&id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state() -> CollectorState {
        let mut state = CollectorState::new(Logger::new());
        state.set_root_frame("ROOT".to_string());
        state
    }

    fn request_sent(id: &str, url: &str, extra: Value) -> Value {
        let mut params = json!({
            "requestId": id,
            "request": {"url": url, "method": "GET", "headers": {}},
            "timestamp": 1.0,
            "wallTime": 1500000000.0,
            "initiator": {"type": "other"},
            "type": "Document",
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut params, extra) {
            for (k, v) in extra {
                base.insert(k, v);
            }
        }
        params
    }

    fn emitted_pairs(actions: Vec<Action>) -> Vec<RequestResponsePair> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                Action::Emit(Event::Pair(pair)) => Some(pair),
                Action::Fetch { pair, .. } => Some(pair),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_request_lifecycle() {
        let mut state = state();
        assert!(state.handle("Network.requestWillBeSent", &request_sent("1", "http://example.com/", json!({}))).is_empty());
        assert!(state
            .handle(
                "Network.responseReceived",
                &json!({
                    "requestId": "1",
                    "timestamp": 1.5,
                    "response": {
                        "url": "http://example.com/",
                        "status": 200,
                        "statusText": "OK",
                        "headers": {"Content-Type": "text/html"},
                        "mimeType": "text/html",
                    },
                }),
            )
            .is_empty());
        let actions = state.handle(
            "Network.loadingFinished",
            &json!({"requestId": "1", "timestamp": 2.0, "encodedDataLength": 1234}),
        );
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Fetch { pair, fetch_response_body } => {
                assert!(*fetch_response_body);
                assert_eq!(pair.url.as_str(), "http://example.com/");
                let response = pair.response.as_ref().unwrap();
                assert_eq!(response.status, 200);
                assert_eq!(response.bytes_received, 1234);
                assert_eq!(pair.resource_type, Some(ResourceType::Document));
            }
            _ => panic!("expected fetch action"),
        }
        // a second loadingFinished for the same id is a no-op
        assert!(state
            .handle("Network.loadingFinished", &json!({"requestId": "1", "timestamp": 2.5}))
            .is_empty());
    }

    #[test]
    fn test_redirect_emits_eagerly_and_reopens() {
        let mut state = state();
        state.handle("Network.requestWillBeSent", &request_sent("1", "http://example.com/a", json!({})));
        let actions = state.handle(
            "Network.requestWillBeSent",
            &request_sent(
                "1",
                "http://example.com/b",
                json!({
                    "redirectResponse": {
                        "url": "http://example.com/a",
                        "status": 301,
                        "headers": {"Location": "/b"},
                        "encodedDataLength": 90,
                    },
                    "timestamp": 1.25,
                }),
            ),
        );
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Fetch { pair, fetch_response_body } => {
                // the redirect's own response body must not be fetched
                assert!(!*fetch_response_body);
                assert_eq!(pair.url.as_str(), "http://example.com/a");
                let response = pair.response.as_ref().unwrap();
                assert_eq!(response.status, 301);
                assert!(response.truncated);
                assert_eq!(response.headers.get("location"), Some("/b"));
            }
            _ => panic!("expected fetch action"),
        }

        // the follow-up request completes under the same id
        state.handle(
            "Network.responseReceived",
            &json!({
                "requestId": "1",
                "timestamp": 1.5,
                "response": {"url": "http://example.com/b", "status": 200, "headers": {}},
            }),
        );
        let actions = state.handle(
            "Network.loadingFinished",
            &json!({"requestId": "1", "timestamp": 2.0, "encodedDataLength": 10}),
        );
        let pairs = emitted_pairs(actions);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].url.as_str(), "http://example.com/b");
        assert_eq!(pairs[0].response.as_ref().unwrap().status, 200);
    }

    #[test]
    fn test_scheme_filter_runs_before_allocation() {
        let mut state = state();
        let actions =
            state.handle("Network.requestWillBeSent", &request_sent("1", "data:text/plain,x", json!({})));
        assert!(actions.is_empty());
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn test_loading_failed_drops_response() {
        let mut state = state();
        state.handle("Network.requestWillBeSent", &request_sent("1", "http://example.com/", json!({})));
        state.handle(
            "Network.responseReceived",
            &json!({
                "requestId": "1",
                "timestamp": 1.5,
                "response": {"url": "http://example.com/", "status": 200, "headers": {}},
            }),
        );
        let actions = state.handle(
            "Network.loadingFailed",
            &json!({"requestId": "1", "timestamp": 2.0, "errorText": "net::ERR_ABORTED"}),
        );
        let pairs = emitted_pairs(actions);
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].response.is_none());
    }

    #[test]
    fn test_loading_failed_unknown_id_is_noop() {
        let mut state = state();
        assert!(state
            .handle("Network.loadingFailed", &json!({"requestId": "42", "errorText": "x"}))
            .is_empty());
    }

    #[test]
    fn test_frame_idle_edges() {
        let mut state = state();
        let actions = state.handle("Page.frameStartedLoading", &json!({"frameId": "A"}));
        assert!(matches!(actions.as_slice(), [Action::Emit(Event::PageIdle(false))]));
        // a second loading frame produces no edge
        assert!(state.handle("Page.frameStartedLoading", &json!({"frameId": "B"})).is_empty());
        assert!(state.handle("Page.frameStoppedLoading", &json!({"frameId": "A"})).is_empty());
        let actions = state.handle("Page.frameStoppedLoading", &json!({"frameId": "B"}));
        assert!(matches!(actions.as_slice(), [Action::Emit(Event::PageIdle(true))]));
        // unknown frame ids do not generate spurious idle events
        assert!(state.handle("Page.frameStoppedLoading", &json!({"frameId": "C"})).is_empty());
    }

    #[test]
    fn test_frame_navigated_root_only() {
        let mut state = state();
        assert!(state
            .handle(
                "Page.frameNavigated",
                &json!({"frame": {"id": "CHILD", "url": "http://example.com/frame"}}),
            )
            .is_empty());
        let actions = state.handle(
            "Page.frameNavigated",
            &json!({"frame": {"id": "ROOT", "url": "http://example.com/", "mimeType": "text/html"}}),
        );
        match actions.as_slice() {
            [Action::Emit(Event::FrameNavigated(navigated))] => {
                assert_eq!(navigated.frame_id, "ROOT");
                assert_eq!(navigated.url.as_str(), "http://example.com/");
                assert_eq!(navigated.mime_type.as_deref(), Some("text/html"));
            }
            _ => panic!("expected FrameNavigated"),
        }
    }

    #[test]
    fn test_dialog_policy() {
        let mut state = state();
        let actions =
            state.handle("Page.javascriptDialogOpening", &json!({"type": "beforeunload"}));
        assert!(matches!(actions.as_slice(), [Action::AnswerDialog { accept: true }]));
        for kind in ["alert", "confirm", "prompt"] {
            let actions =
                state.handle("Page.javascriptDialogOpening", &json!({"type": kind}));
            assert!(matches!(actions.as_slice(), [Action::AnswerDialog { accept: false }]));
        }
        assert!(state
            .handle("Page.javascriptDialogOpening", &json!({"type": "onbeforeunload"}))
            .is_empty());
    }

    #[test]
    fn test_header_folding() {
        let headers = Headers::from_cdp(&json!({
            "Set-Cookie": "a=1\nb=2\nc=3",
            "Content-Type": "text/html",
        }));
        assert_eq!(headers.len(), 4);
        let cookies: Vec<&str> = headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, v)| v)
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2", "c=3"]);
        assert_eq!(headers.get("content-type"), Some("text/html"));
    }

    #[test]
    fn test_headers_replace_and_remove() {
        let mut headers = Headers::new();
        headers.push("Content-Length", "10");
        headers.push("content-length", "11");
        headers.replace("Content-Length", "12");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("CONTENT-LENGTH"), Some("12"));
        headers.remove("content-length");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_body_equality_ignores_tag() {
        assert_eq!(Body::Unicode(b"abc".to_vec()), Body::Base64(b"abc".to_vec()));
        assert_ne!(Body::Unicode(b"abc".to_vec()), Body::Unicode(b"abd".to_vec()));
    }

    #[test]
    fn test_timestamps_derive_from_reference() {
        let mut state = state();
        state.handle("Network.requestWillBeSent", &request_sent("1", "http://example.com/", json!({})));
        state.handle(
            "Network.responseReceived",
            &json!({
                "requestId": "1",
                "timestamp": 2.5,
                "response": {"url": "http://example.com/", "status": 200, "headers": {}},
            }),
        );
        let actions = state.handle(
            "Network.loadingFinished",
            &json!({"requestId": "1", "timestamp": 3.0, "encodedDataLength": 1}),
        );
        let pairs = emitted_pairs(actions);
        let pair = &pairs[0];
        let response = pair.response.as_ref().unwrap();
        // request at wallTime, response offset by the monotonic delta
        assert_eq!(pair.request.timestamp.timestamp(), 1_500_000_000);
        let delta = response.timestamp - pair.request.timestamp;
        assert_eq!(delta.num_milliseconds(), 1500);
    }

    #[test]
    fn test_resource_type_parsing() {
        assert_eq!(ResourceType::from_cdp("XHR"), ResourceType::Xhr);
        assert_eq!(ResourceType::from_cdp("Document"), ResourceType::Document);
        assert_eq!(ResourceType::from_cdp("CSPViolationReport"), ResourceType::Other);
    }

    proptest! {
        #[test]
        fn prop_folded_headers_have_no_newlines(values in proptest::collection::vec("[ -~]{0,12}", 1..6)) {
            let folded = values.join("\n");
            let headers = Headers::from_cdp(&json!({"x-multi": folded}));
            prop_assert_eq!(headers.len(), values.len());
            for (_, value) in headers.iter() {
                prop_assert!(!value.contains('\n'));
            }
        }
    }
}
