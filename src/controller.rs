//! Drive a single page grab to completion.
//!
//! The controller sequences navigation, behavior phases and idle/timeout
//! detection, and multiplexes every produced event to the registered
//! handlers (stats, log, WARC writer).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use url::Url;

use crate::behavior::{self, Behavior, DomSnapshotEvent, ExtractLinksEvent, Script, ScreenshotEvent};
use crate::browser::{FrameNavigated, RequestResponsePair, SiteLoader};
use crate::devtools::{Browser, BrowserService};
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::util;

/// Everything the grab engine can emit towards its consumers.
///
/// Events within one request id preserve DevTools order; `ControllerStart`
/// is always pushed first.
#[derive(Debug, Clone)]
pub enum Event {
    /// Grab metadata: software, browser, parameters. Becomes the warcinfo
    /// record.
    ControllerStart(Value),
    Pair(RequestResponsePair),
    PageIdle(bool),
    FrameNavigated(FrameNavigated),
    Script(Script),
    Screenshot(ScreenshotEvent),
    DomSnapshot(DomSnapshotEvent),
    ExtractLinks(ExtractLinksEvent),
}

/// Consumer of grab events. Handlers are invoked sequentially and must be
/// idempotent under partial-stream termination.
#[async_trait]
pub trait EventHandler: Send {
    async fn push(&mut self, event: &Event) -> Result<()>;

    /// Called once after the grab finished, for buffered output.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Basic transfer statistics, shared with the caller.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub requests: u64,
    pub finished: u64,
    pub failed: u64,
    pub bytes_rcv: u64,
}

pub struct StatsHandler {
    stats: Arc<Mutex<Stats>>,
}

impl StatsHandler {
    pub fn new() -> Self {
        Self { stats: Arc::new(Mutex::new(Stats::default())) }
    }

    pub fn stats(&self) -> Arc<Mutex<Stats>> {
        self.stats.clone()
    }
}

impl Default for StatsHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for StatsHandler {
    async fn push(&mut self, event: &Event) -> Result<()> {
        if let Event::Pair(pair) = event {
            if let Ok(mut stats) = self.stats.lock() {
                stats.requests += 1;
                match &pair.response {
                    Some(response) => {
                        stats.finished += 1;
                        stats.bytes_rcv += response.bytes_received;
                    }
                    None => stats.failed += 1,
                }
            }
        }
        Ok(())
    }
}

/// Logs information about selected events, most importantly the extracted
/// links consumed by the recursive driver.
pub struct LogHandler {
    logger: Logger,
}

impl LogHandler {
    pub fn new(logger: &Logger) -> Self {
        Self { logger: logger.bind(json!({"context": "LogHandler"})) }
    }
}

#[async_trait]
impl EventHandler for LogHandler {
    async fn push(&mut self, event: &Event) -> Result<()> {
        if let Event::ExtractLinks(extracted) = event {
            // bounded number of links per entry, so a single json blob
            // cannot grow unreasonably large
            for chunk in extracted.links.chunks(100) {
                let links: Vec<&str> = chunk.iter().map(Url::as_str).collect();
                self.logger.info(
                    "extracted links",
                    json!({
                        "uuid": "8ee5e9c9-1130-4c5c-88ff-718508546e0c",
                        "links": links,
                    }),
                );
            }
        }
        Ok(())
    }
}

struct IdleInner {
    idle: AtomicBool,
    since: Mutex<Instant>,
}

/// Tracks `PageIdle` events into a timer-friendly queryable state.
#[derive(Clone)]
pub struct IdleStateTracker {
    inner: Arc<IdleInner>,
}

impl IdleStateTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(IdleInner {
                idle: AtomicBool::new(true),
                since: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn observe(&self, event: &Event) {
        if let Event::PageIdle(idle) = event {
            self.inner.idle.store(*idle, Ordering::Relaxed);
            if *idle {
                if let Ok(mut since) = self.inner.since.lock() {
                    *since = Instant::now();
                }
            }
        }
    }

    /// Wait until the page has been idle for at least `timeout`. Returns
    /// immediately when that much idle time has already accumulated.
    pub async fn wait(&self, timeout: Duration) {
        loop {
            let sleep_for = if self.inner.idle.load(Ordering::Relaxed) {
                let since = self.inner.since.lock().map(|s| *s).unwrap_or_else(|_| Instant::now());
                let elapsed = since.elapsed();
                if elapsed >= timeout {
                    return;
                }
                timeout - elapsed
            } else {
                // not idle, check again after the full window
                timeout
            };
            tokio::time::sleep(sleep_for).await;
        }
    }
}

impl Default for IdleStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Fans one event out to the idle tracker and every registered handler.
pub(crate) struct Dispatcher {
    handlers: tokio::sync::Mutex<Vec<Box<dyn EventHandler>>>,
    idle: IdleStateTracker,
}

impl Dispatcher {
    pub(crate) fn new(handlers: Vec<Box<dyn EventHandler>>, idle: IdleStateTracker) -> Self {
        Self { handlers: tokio::sync::Mutex::new(handlers), idle }
    }

    pub(crate) async fn push(&self, event: Event) -> Result<()> {
        self.idle.observe(&event);
        let mut handlers = self.handlers.lock().await;
        for handler in handlers.iter_mut() {
            handler.push(&event).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        for handler in handlers.iter_mut() {
            handler.flush().await?;
        }
        Ok(())
    }
}

/// Sink handed to behavior hooks; emitted events travel through the same
/// handler chain as network events.
pub struct EventSink<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> EventSink<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn emit(&mut self, event: Event) -> Result<()> {
        self.dispatcher.push(event).await
    }
}

/// Runs behavior hooks at the right lifecycle points. Scripts are
/// re-injected on every root frame navigation; stop and finish hooks only
/// run after at least one load.
pub(crate) struct BehaviorRunner {
    behaviors: Vec<Box<dyn Behavior>>,
    loaded: bool,
}

impl BehaviorRunner {
    fn new(behaviors: Vec<Box<dyn Behavior>>) -> Self {
        Self { behaviors, loaded: false }
    }

    async fn on_load(&mut self, dispatcher: &Dispatcher) -> Result<()> {
        for behavior in &mut self.behaviors {
            let mut sink = EventSink::new(dispatcher);
            behavior.on_load(&mut sink).await?;
        }
        self.loaded = true;
        Ok(())
    }

    async fn on_stop(&mut self, dispatcher: &Dispatcher) -> Result<()> {
        if !self.loaded {
            return Ok(());
        }
        for behavior in &mut self.behaviors {
            let mut sink = EventSink::new(dispatcher);
            behavior.on_stop(&mut sink).await?;
        }
        Ok(())
    }

    async fn on_finish(&mut self, dispatcher: &Dispatcher) -> Result<()> {
        if !self.loaded {
            return Ok(());
        }
        for behavior in &mut self.behaviors {
            let mut sink = EventSink::new(dispatcher);
            behavior.on_finish(&mut sink).await?;
        }
        Ok(())
    }
}

/// Grab timing and TLS configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Quiescence window after which the page is considered done.
    pub idle_timeout: Duration,
    /// Absolute wall-clock deadline for the whole grab.
    pub timeout: Duration,
    /// Suppress certificate validation.
    pub insecure: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            insecure: false,
        }
    }
}

/// Archive a single page URL.
///
/// Dispatches between the producers (site loader and behavior scripts) and
/// the consumers (stats, log, WARC writer).
pub struct SinglePageController {
    pub url: Url,
    pub service: BrowserService,
    pub settings: ControllerSettings,
    /// Behavior names to enable, in canonical order.
    pub behavior_names: Vec<String>,
    /// Extra JSON merged into the `ControllerStart` payload.
    pub warcinfo: Option<Value>,
    pub logger: Logger,
    pub handlers: Vec<Box<dyn EventHandler>>,
}

impl SinglePageController {
    pub async fn run(mut self) -> Result<()> {
        let endpoint = self.service.acquire().await?;
        let result = self.grab(endpoint).await;
        // the browser child is reaped no matter how the grab went
        self.service.release().await;
        result
    }

    async fn grab(&mut self, endpoint: Url) -> Result<()> {
        let logger = self
            .logger
            .bind(json!({"context": "SinglePageController", "url": self.url.as_str()}));

        let browser = Browser::new(endpoint);
        let mut loader = SiteLoader::attach(browser, &self.logger).await?;
        let tab = loader.tab.clone();
        let deadline = Instant::now() + self.settings.timeout;

        tab.call(
            "Security.setIgnoreCertificateErrors",
            json!({"ignore": self.settings.insecure}),
        )
        .await?;

        let enabled: Vec<Box<dyn Behavior>> =
            behavior::build(&self.behavior_names, &tab, &self.logger)?
                .into_iter()
                .filter(|b| b.contains(&self.url))
                .collect();
        let enabled_names: Vec<&str> = enabled.iter().map(|b| b.name()).collect();

        let version = tab.call("Browser.getVersion", json!({})).await?;
        let mut payload = json!({
            "software": util::software_info(),
            "browser": {
                "product": version["product"],
                "useragent": version["userAgent"],
                "viewport": util::viewport_metrics(&tab).await?,
            },
            "tool": "crocoite-single",
            "parameters": {
                "url": self.url.as_str(),
                "idleTimeout": self.settings.idle_timeout.as_secs_f64(),
                "timeout": self.settings.timeout.as_secs_f64(),
                "behavior": enabled_names,
                "insecure": self.settings.insecure,
            },
        });
        if let Some(extra) = self.warcinfo.take() {
            payload["extra"] = extra;
        }

        let idle = IdleStateTracker::new();
        let dispatcher = Arc::new(Dispatcher::new(std::mem::take(&mut self.handlers), idle.clone()));
        dispatcher.push(Event::ControllerStart(payload)).await?;

        loader.navigate(&self.url).await?;

        let behaviors = Arc::new(tokio::sync::Mutex::new(BehaviorRunner::new(enabled)));
        let mut drain = tokio::spawn(drain(loader, dispatcher.clone(), behaviors.clone()));
        let mut drain_finished = false;

        tokio::select! {
            res = &mut drain => {
                drain_finished = true;
                logger.error(
                    "fetch failed",
                    json!({"uuid": "43a0686a-a3a9-4214-9acd-43f6976f8ff3"}),
                );
                join_result(res)?;
            }
            _ = idle.wait(self.settings.idle_timeout) => {
                logger.debug(
                    "idle timeout",
                    json!({"uuid": "90702590-94c4-44ef-9b37-02a16de444c3"}),
                );
            }
            _ = tokio::time::sleep_until(deadline) => {
                logger.debug(
                    "global timeout",
                    json!({"uuid": "2f858adc-9448-4ace-94b4-7cd1484c0728"}),
                );
            }
        }

        // STOPPING: let behaviors wind down, then halt the page and give
        // in-flight network events a moment to flush
        behaviors.lock().await.on_stop(&dispatcher).await?;
        tab.call("Page.stopLoading", json!({})).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        // FINISHING: snapshot-style behaviors run now, then wait (bounded)
        // for anything they triggered to drain
        behaviors.lock().await.on_finish(&dispatcher).await?;
        let _ = tokio::time::timeout(Duration::from_secs(1), idle.wait(Duration::from_secs(1))).await;

        if !drain_finished {
            drain.abort();
            join_result(drain.await)?;
        }
        dispatcher.flush().await?;
        Ok(())
    }
}

async fn drain(
    mut loader: SiteLoader,
    dispatcher: Arc<Dispatcher>,
    behaviors: Arc<tokio::sync::Mutex<BehaviorRunner>>,
) -> Result<()> {
    loop {
        let event = loader.next().await?;
        let navigated = matches!(&event, Event::FrameNavigated(_));
        dispatcher.push(event).await?;
        if navigated {
            behaviors.lock().await.on_load(&dispatcher).await?;
        }
    }
}

fn join_result(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Body, Headers, Request, Response};
    use chrono::Utc;

    fn pair(id: &str, response: Option<Response>) -> RequestResponsePair {
        RequestResponsePair {
            id: id.to_string(),
            url: Url::parse("http://example.com/").unwrap(),
            request: Request {
                method: "GET".into(),
                headers: Headers::new(),
                body: None,
                has_post_data: false,
                initiator: None,
                timestamp: Utc::now(),
            },
            response,
            remote_address: None,
            protocol: None,
            resource_type: None,
        }
    }

    fn response(bytes_received: u64) -> Response {
        Response {
            status: 200,
            status_text: None,
            headers: Headers::new(),
            body: Some(Body::Unicode(Vec::new())),
            mime_type: None,
            bytes_received,
            timestamp: Utc::now(),
            truncated: false,
            from_disk_cache: None,
            connection_reused: None,
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.idle_timeout, Duration::from_secs(2));
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert!(!settings.insecure);
    }

    #[tokio::test]
    async fn test_stats_handler_counts() {
        let mut handler = StatsHandler::new();
        let stats = handler.stats();
        handler.push(&Event::Pair(pair("1", Some(response(512))))).await.unwrap();
        handler.push(&Event::Pair(pair("2", None))).await.unwrap();
        handler.push(&Event::PageIdle(true)).await.unwrap();

        let stats = stats.lock().unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.bytes_rcv, 512);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_wait_returns_after_window() {
        let idle = IdleStateTracker::new();
        let start = Instant::now();
        idle.wait(Duration::from_secs(2)).await;
        // idle since construction, so the wait takes exactly the window
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_wait_restarts_on_activity() {
        let idle = IdleStateTracker::new();
        idle.observe(&Event::PageIdle(false));

        let waiter = idle.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(1)).await });

        // busy for three seconds, then idle again
        tokio::time::sleep(Duration::from_secs(3)).await;
        idle.observe(&Event::PageIdle(true));
        let start = Instant::now();
        handle.await.unwrap();
        assert!(start.elapsed() <= Duration::from_secs(2));
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn push(&mut self, _event: &Event) -> Result<()> {
            Err(Error::Internal("handler broke".into()))
        }
    }

    #[tokio::test]
    async fn test_dispatcher_propagates_handler_failure() {
        let dispatcher = Dispatcher::new(vec![Box::new(FailingHandler)], IdleStateTracker::new());
        assert!(dispatcher.push(Event::PageIdle(true)).await.is_err());
    }

    #[tokio::test]
    async fn test_log_handler_chunks_links() {
        use crate::logger::{Consumer, Level};
        use serde_json::Map;

        struct Count(Arc<Mutex<usize>>);
        impl Consumer for Count {
            fn consume(&self, _level: Level, entry: &Map<String, Value>) {
                if entry["uuid"] == "8ee5e9c9-1130-4c5c-88ff-718508546e0c" {
                    *self.0.lock().unwrap() += 1;
                }
            }
        }

        let count = Arc::new(Mutex::new(0));
        let logger = Logger::new();
        logger.connect(Arc::new(Count(count.clone())));

        let links: Vec<Url> = (0..250)
            .map(|i| Url::parse(&format!("http://example.com/{i}")).unwrap())
            .collect();
        let mut handler = LogHandler::new(&logger);
        handler
            .push(&Event::ExtractLinks(ExtractLinksEvent { links }))
            .await
            .unwrap();
        assert_eq!(*count.lock().unwrap(), 3);
    }
}
