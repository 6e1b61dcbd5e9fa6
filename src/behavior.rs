//! Behaviors manipulate the loaded page and emit synthetic archival
//! events.
//!
//! They exercise their power either through DevTools calls or by injecting
//! JavaScript into the page context, and run at three points of the grab
//! lifecycle: after the page started loading (`on_load`, re-run on every
//! root frame navigation), before loading is stopped (`on_stop`) and after
//! it was stopped (`on_finish`). Emitted events travel through the same
//! handler chain as network traffic, so captured screenshots and snapshots
//! end up in the WARC file.

use std::collections::HashSet;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::controller::{Event, EventSink};
use crate::devtools::Tab;
use crate::error::{Error, Result};
use crate::html;
use crate::logger::Logger;
use crate::util;

/// A JavaScript resource, bundled or built at runtime.
///
/// Behaviors emit the `Script` before evaluating it, so the archiver
/// records the exact source that ran.
#[derive(Debug, Clone)]
pub struct Script {
    /// Bundle-relative path; `None` for anonymous scripts.
    pub path: Option<String>,
    /// Absolute filesystem origin, recorded for provenance.
    pub abspath: Option<String>,
    pub data: String,
}

impl Script {
    fn asset(name: &str, data: &str) -> Self {
        Self {
            path: Some(name.to_string()),
            abspath: Some(format!("{}/data/{}", env!("CARGO_MANIFEST_DIR"), name)),
            data: data.to_string(),
        }
    }

    pub fn inline(data: String, path: Option<String>) -> Self {
        Self { path, abspath: None, data }
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.data)
    }
}

/// Full-page screenshot band.
#[derive(Debug, Clone)]
pub struct ScreenshotEvent {
    pub url: Option<Url>,
    /// Vertical offset of this band in pixels.
    pub yoff: u64,
    /// PNG bytes.
    pub data: Vec<u8>,
}

/// Serialized snapshot of one document on the page.
#[derive(Debug, Clone)]
pub struct DomSnapshotEvent {
    pub url: Url,
    pub document: Vec<u8>,
    pub viewport: String,
}

/// All link-like URLs visible on the page, deduplicated.
#[derive(Debug, Clone)]
pub struct ExtractLinksEvent {
    pub links: Vec<Url>,
}

/// A named unit participating in the grab lifecycle.
#[async_trait]
pub trait Behavior: Send {
    fn name(&self) -> &'static str;

    /// URL filter; behaviors accept every URL by default.
    fn contains(&self, _url: &Url) -> bool {
        true
    }

    async fn on_load(&mut self, _out: &mut EventSink<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&mut self, _out: &mut EventSink<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_finish(&mut self, _out: &mut EventSink<'_>) -> Result<()> {
        Ok(())
    }
}

/// Shared mechanics of behaviors that inject a script on load.
///
/// The script must evaluate to a class constructor, which is invoked with
/// an options object; `stop` calls the instance's `stop()` method and
/// releases the remote object. Protocol failures during stop are logged,
/// never fatal.
struct JsOnload {
    tab: Tab,
    logger: Logger,
    script: Script,
    options: Value,
    context: Option<String>,
}

impl JsOnload {
    fn new(tab: Tab, logger: Logger, script: Script) -> Self {
        Self { tab, logger, script, options: json!({}), context: None }
    }

    async fn load(&mut self, out: &mut EventSink<'_>) -> Result<()> {
        out.emit(Event::Script(self.script.clone())).await?;
        let result = self
            .tab
            .call("Runtime.evaluate", json!({"expression": self.script.data}))
            .await?;
        self.logger.debug(
            "behavior onload inject",
            json!({
                "uuid": "a2da9b78-5648-44c5-bfa8-5c7573e13ad3",
                "result": result.clone(),
            }),
        );
        let script = self.script.path.as_deref().unwrap_or("anonymous");
        let object = &result["result"];
        if object["type"] != "function" || object["subtype"] == "error" {
            return Err(Error::BehaviorScript(format!(
                "{script} did not evaluate to a constructor"
            )));
        }
        let Some(constructor) = object["objectId"].as_str() else {
            return Err(Error::BehaviorScript(format!(
                "{script} constructor has no object id"
            )));
        };

        if self.options.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            let rendered = serde_json::to_string_pretty(&self.options)?;
            out.emit(Event::Script(Script::inline(rendered, Some(format!("{script}#options")))))
                .await?;
        }

        let started = self
            .tab
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "functionDeclaration": "function(options){return new this(options);}",
                    "objectId": constructor,
                    "arguments": [{"value": self.options}],
                }),
            )
            .await?;
        self.logger.debug(
            "behavior onload start",
            json!({
                "uuid": "6c0605ae-93b3-46b3-b575-ba45790909a7",
                "result": started.clone(),
            }),
        );
        let instance = &started["result"];
        if instance["type"] != "object" || instance["subtype"] == "error" {
            return Err(Error::BehaviorScript(format!(
                "{script} constructor did not produce an object"
            )));
        }
        let object_id = instance["objectId"].as_str().ok_or_else(|| {
            Error::BehaviorScript(format!("{script} instance has no object id"))
        })?;
        self.context = Some(object_id.to_string());
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(context) = self.context.take() else { return };
        if let Err(e) = self
            .tab
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "functionDeclaration": "function(){return this.stop();}",
                    "objectId": context,
                }),
            )
            .await
        {
            // nothing to be done about it at this point
            self.logger.error(
                "behavior stop failed",
                json!({
                    "uuid": "1786726f-c8ec-4f79-8769-30954d4e32f5",
                    "error": e.to_string(),
                    "objectId": context,
                }),
            );
            return;
        }
        if let Err(e) = self
            .tab
            .call("Runtime.releaseObject", json!({"objectId": context}))
            .await
        {
            self.logger.error(
                "behavior release failed",
                json!({
                    "uuid": "5c27ace6-6ea3-4f81-9ec5-d0566f31b0a7",
                    "error": e.to_string(),
                }),
            );
        }
    }
}

/// Periodically scroll to the bottom of the page, triggering lazy-loaded
/// content.
pub struct Scroll {
    inner: JsOnload,
}

impl Scroll {
    pub fn new(tab: Tab, logger: &Logger) -> Self {
        let logger = logger.bind(json!({"context": "Scroll"}));
        Self {
            inner: JsOnload::new(tab, logger, Script::asset("scroll.js", include_str!("../data/scroll.js"))),
        }
    }
}

#[async_trait]
impl Behavior for Scroll {
    fn name(&self) -> &'static str {
        "scroll"
    }

    async fn on_load(&mut self, out: &mut EventSink<'_>) -> Result<()> {
        self.inner.load(out).await
    }

    async fn on_stop(&mut self, _out: &mut EventSink<'_>) -> Result<()> {
        self.inner.stop().await;
        Ok(())
    }
}

pub(crate) fn click_sites() -> Result<Vec<Value>> {
    let mut sites = Vec::new();
    for document in serde_yaml::Deserializer::from_str(include_str!("../data/click.yaml")) {
        let value = serde_yaml::Value::deserialize(document)?;
        sites.push(serde_json::to_value(value)?);
    }
    Ok(sites)
}

/// Click page elements matching the bundled per-site configuration.
pub struct Click {
    inner: JsOnload,
}

impl Click {
    pub fn new(tab: Tab, logger: &Logger) -> Result<Self> {
        let logger = logger.bind(json!({"context": "Click"}));
        let mut inner =
            JsOnload::new(tab, logger, Script::asset("click.js", include_str!("../data/click.js")));
        inner.options = json!({"sites": click_sites()?});
        Ok(Self { inner })
    }
}

#[async_trait]
impl Behavior for Click {
    fn name(&self) -> &'static str {
        "click"
    }

    async fn on_load(&mut self, out: &mut EventSink<'_>) -> Result<()> {
        self.inner.load(out).await
    }

    async fn on_stop(&mut self, _out: &mut EventSink<'_>) -> Result<()> {
        self.inner.stop().await;
        Ok(())
    }
}

/// Cycle through different screen metrics, causing the site to fetch
/// assets (img srcset and css media queries, for example) for other
/// resolutions.
pub struct EmulateScreenMetrics {
    tab: Tab,
    logger: Logger,
}

impl EmulateScreenMetrics {
    pub fn new(tab: Tab, logger: &Logger) -> Self {
        Self { tab, logger: logger.bind(json!({"context": "EmulateScreenMetrics"})) }
    }
}

#[async_trait]
impl Behavior for EmulateScreenMetrics {
    fn name(&self) -> &'static str {
        "emulateScreenMetrics"
    }

    async fn on_stop(&mut self, _out: &mut EventSink<'_>) -> Result<()> {
        const CSS_PPI: f64 = 96.0;
        let sizes = [
            json!({"width": 1920, "height": 1080, "deviceScaleFactor": 1.5, "mobile": false}),
            json!({"width": 1920, "height": 1080, "deviceScaleFactor": 2, "mobile": false}),
            // very dense display
            json!({"width": 1920, "height": 1080, "deviceScaleFactor": 4, "mobile": false}),
            // 1st gen iPhone (portrait mode)
            json!({"width": 320, "height": 480, "deviceScaleFactor": 163.0 / CSS_PPI, "mobile": true}),
            // 6th gen iPhone (portrait mode)
            json!({"width": 750, "height": 1334, "deviceScaleFactor": 326.0 / CSS_PPI, "mobile": true}),
        ];
        for size in sizes {
            self.logger.debug(
                "device override",
                json!({
                    "uuid": "3d2d8096-1a75-4830-ad79-ae5f6f97071d",
                    "size": size.clone(),
                }),
            );
            self.tab.call("Emulation.setDeviceMetricsOverride", size).await?;
            // give the browser time to re-evaluate the page and start
            // fetching
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        self.logger.debug(
            "clear override",
            json!({"uuid": "f9401683-eb3a-4b86-9bb2-c8c5d876fc8d"}),
        );
        self.tab.call("Emulation.clearDeviceMetricsOverride", json!({})).await?;
        Ok(())
    }
}

/// Hardcoded maximum texture size; the renderer cannot produce larger
/// captures.
const MAX_SCREENSHOT_DIM: u64 = 16 * 1024;

fn screenshot_bands(content_height: u64, max_dim: u64) -> Vec<(u64, u64)> {
    let mut bands = Vec::new();
    let mut yoff = 0;
    while yoff < content_height {
        bands.push((yoff, (content_height - yoff).min(max_dim)));
        yoff += max_dim;
    }
    bands
}

/// Capture the full page as horizontal PNG bands.
pub struct Screenshot {
    tab: Tab,
    logger: Logger,
    script: Script,
}

impl Screenshot {
    pub fn new(tab: Tab, logger: &Logger) -> Self {
        Self {
            tab,
            logger: logger.bind(json!({"context": "Screenshot"})),
            script: Script::asset("screenshot.js", include_str!("../data/screenshot.js")),
        }
    }
}

#[async_trait]
impl Behavior for Screenshot {
    fn name(&self) -> &'static str {
        "screenshot"
    }

    async fn on_finish(&mut self, out: &mut EventSink<'_>) -> Result<()> {
        // elements with position: fixed may extend beyond the layout
        // content size; the script reports their scroll heights
        out.emit(Event::Script(self.script.clone())).await?;
        let result = self
            .tab
            .call(
                "Runtime.evaluate",
                json!({"expression": self.script.data, "returnByValue": true}),
            )
            .await?;
        let script_heights: Vec<f64> = result["result"]["value"]
            .as_array()
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();

        let metrics = self.tab.call("Page.getLayoutMetrics", json!({})).await?;
        let content_size = &metrics["contentSize"];
        let content_width = content_size["width"].as_f64().unwrap_or(0.0);
        let mut content_height = content_size["height"].as_f64().unwrap_or(0.0);
        for height in script_heights {
            content_height = content_height.max(height);
        }
        let content_height = content_height.ceil() as u64;

        // the viewport override makes the browser render the entire page,
        // not just the visible part
        let override_metrics = json!({
            "width": 0,
            "height": 0,
            "deviceScaleFactor": 0,
            "mobile": false,
            "viewport": {
                "x": 0,
                "y": 0,
                "width": content_width,
                "height": content_height,
                "scale": 1,
            },
        });
        self.logger.debug(
            "screenshot override",
            json!({
                "uuid": "e0affa18-cbb1-4d97-9d13-9a88f704b1b2",
                "override": override_metrics.clone(),
            }),
        );
        self.tab
            .call("Emulation.setDeviceMetricsOverride", override_metrics)
            .await?;

        let tree = self.tab.call("Page.getFrameTree", json!({})).await?;
        let frame_url = tree["frameTree"]["frame"]["url"]
            .as_str()
            .and_then(|u| Url::parse(u).ok());
        let url = match frame_url {
            Some(mut url) => {
                url.set_fragment(None);
                Some(url)
            }
            None => {
                self.logger.error(
                    "frame without url",
                    json!({
                        "uuid": "edc2743d-b93e-4ba1-964e-db232f2f96ff",
                        "tree": tree,
                    }),
                );
                None
            }
        };

        // horizontal scroll is ignored intentionally, horizontal layouts
        // usually scroll via javascript without extending the viewport
        let width = (content_width.ceil() as u64).min(MAX_SCREENSHOT_DIM);
        for (yoff, height) in screenshot_bands(content_height, MAX_SCREENSHOT_DIM) {
            let captured = self
                .tab
                .call(
                    "Page.captureScreenshot",
                    json!({
                        "format": "png",
                        "clip": {"x": 0, "y": yoff, "width": width, "height": height, "scale": 1},
                    }),
                )
                .await?;
            let data = BASE64
                .decode(captured["data"].as_str().unwrap_or(""))
                .unwrap_or_default();
            out.emit(Event::Screenshot(ScreenshotEvent { url: url.clone(), yoff, data }))
                .await?;
        }

        self.tab.call("Emulation.clearDeviceMetricsOverride", json!({})).await?;
        Ok(())
    }
}

/// Serialize every http(s) document on the page to static HTML.
pub struct DomSnapshot {
    tab: Tab,
    logger: Logger,
}

impl DomSnapshot {
    pub fn new(tab: Tab, logger: &Logger) -> Self {
        Self { tab, logger: logger.bind(json!({"context": "DomSnapshot"})) }
    }
}

#[async_trait]
impl Behavior for DomSnapshot {
    fn name(&self) -> &'static str {
        "domSnapshot"
    }

    async fn on_finish(&mut self, out: &mut EventSink<'_>) -> Result<()> {
        let viewport = util::viewport_metrics(&self.tab).await?;
        let dom = self
            .tab
            .call("DOM.getDocument", json!({"depth": -1, "pierce": true}))
            .await?;

        let mut have_urls: HashSet<Url> = HashSet::new();
        for document in html::split_documents(&dom["root"]) {
            let Some(mut url) = document["documentURL"]
                .as_str()
                .and_then(|u| Url::parse(u).ok())
            else {
                continue;
            };
            url.set_fragment(None);
            if have_urls.contains(&url) {
                // usually javascript-injected iframes with no src
                self.logger.warning(
                    "dom snapshot duplicate",
                    json!({
                        "uuid": "d44de989-98d4-456e-82e7-9d4c49acab5e",
                        "url": url.as_str(),
                    }),
                );
                continue;
            }
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            self.logger.debug(
                "dom snapshot",
                json!({
                    "uuid": "ece7ff05-ccd9-44b5-b6a8-be25a24b96f4",
                    "base": document["baseURL"].as_str(),
                }),
            );
            have_urls.insert(url.clone());
            // scripts were enabled while the snapshot was taken, drop them
            // so the result stays static
            let rendered = html::serialize(document, &["script", "noscript"]);
            out.emit(Event::DomSnapshot(DomSnapshotEvent {
                url,
                document: rendered.into_bytes(),
                viewport: viewport.clone(),
            }))
            .await?;
        }
        Ok(())
    }
}

/// Collect all link-like URLs visible on the page.
///
/// Retrieving an HTML snapshot and parsing it here would require resolving
/// relative links manually; the injected script lets the browser do that.
pub struct ExtractLinks {
    tab: Tab,
    script: Script,
}

impl ExtractLinks {
    pub fn new(tab: Tab, _logger: &Logger) -> Self {
        Self {
            tab,
            script: Script::asset("extract-links.js", include_str!("../data/extract-links.js")),
        }
    }
}

#[async_trait]
impl Behavior for ExtractLinks {
    fn name(&self) -> &'static str {
        "extractLinks"
    }

    async fn on_finish(&mut self, out: &mut EventSink<'_>) -> Result<()> {
        out.emit(Event::Script(self.script.clone())).await?;
        let result = self
            .tab
            .call(
                "Runtime.evaluate",
                json!({"expression": self.script.data, "returnByValue": true}),
            )
            .await?;

        let mut seen = HashSet::new();
        let mut links = Vec::new();
        if let Some(candidates) = result["result"]["value"].as_array() {
            for candidate in candidates {
                // unparsable candidates are skipped silently
                if let Some(url) = candidate.as_str().and_then(|s| Url::parse(s).ok()) {
                    if seen.insert(url.clone()) {
                        links.push(url);
                    }
                }
            }
        }
        out.emit(Event::ExtractLinks(ExtractLinksEvent { links })).await?;
        Ok(())
    }
}

/// Available behaviors in execution order. Order matters: behaviors
/// modifying the page (snapshots, screen metrics) come last.
pub const AVAILABLE: &[&str] = &[
    "scroll",
    "click",
    "extractLinks",
    "screenshot",
    "emulateScreenMetrics",
    "domSnapshot",
];

pub fn default_names() -> Vec<String> {
    AVAILABLE.iter().map(|n| n.to_string()).collect()
}

/// Instantiate the requested behaviors in canonical order.
pub fn build(names: &[String], tab: &Tab, logger: &Logger) -> Result<Vec<Box<dyn Behavior>>> {
    for name in names {
        if !AVAILABLE.contains(&name.as_str()) {
            return Err(Error::UnknownBehavior(name.clone()));
        }
    }
    let mut behaviors: Vec<Box<dyn Behavior>> = Vec::new();
    for name in AVAILABLE {
        if !names.iter().any(|n| n == name) {
            continue;
        }
        behaviors.push(match *name {
            "scroll" => Box::new(Scroll::new(tab.clone(), logger)),
            "click" => Box::new(Click::new(tab.clone(), logger)?),
            "extractLinks" => Box::new(ExtractLinks::new(tab.clone(), logger)),
            "screenshot" => Box::new(Screenshot::new(tab.clone(), logger)),
            "emulateScreenMetrics" => Box::new(EmulateScreenMetrics::new(tab.clone(), logger)),
            "domSnapshot" => Box::new(DomSnapshot::new(tab.clone(), logger)),
            _ => continue,
        });
    }
    Ok(behaviors)
}
