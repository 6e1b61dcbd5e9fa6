//! Write grab events into a gzipped WARC file.
//!
//! Every record is its own gzip member, so standard WARC tooling can seek
//! and split the file. One `warcinfo` record carrying the grab metadata
//! precedes all others; request/response pairs, behavior scripts,
//! screenshots, DOM snapshots and buffered log output follow as they are
//! pushed.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::behavior::{DomSnapshotEvent, Script, ScreenshotEvent};
use crate::browser::{RequestResponsePair, ResourceType};
use crate::controller::{Event, EventHandler};
use crate::error::Result;
use crate::logger::{BufferConsumer, Consumer, Level, Logger};
use crate::util;

/// Buffered log entries are flushed into a metadata record once this many
/// accumulated.
const LOG_BUFFER_CAPACITY: usize = 1000;

struct Record<'a> {
    kind: &'static str,
    target_uri: Option<&'a str>,
    date: DateTime<Utc>,
    content_type: &'a str,
    extra: Vec<(String, String)>,
    block: &'a [u8],
}

/// Low-level record serializer; one gzip member per record.
pub struct WarcWriter<W: Write> {
    out: W,
}

impl<W: Write> WarcWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_record(&mut self, record: Record<'_>) -> Result<String> {
        let record_id = format!("<urn:uuid:{}>", Uuid::new_v4());
        let mut head = String::new();
        head.push_str("WARC/1.0\r\n");
        head.push_str(&format!("WARC-Type: {}\r\n", record.kind));
        head.push_str(&format!("WARC-Record-ID: {record_id}\r\n"));
        head.push_str(&format!(
            "WARC-Date: {}\r\n",
            record.date.format("%Y-%m-%dT%H:%M:%SZ")
        ));
        if let Some(target) = record.target_uri {
            head.push_str(&format!("WARC-Target-URI: {target}\r\n"));
        }
        for (name, value) in &record.extra {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Type: {}\r\n", record.content_type));
        head.push_str(&format!("Content-Length: {}\r\n", record.block.len()));
        head.push_str("\r\n");

        let mut encoder = GzEncoder::new(&mut self.out, Compression::default());
        encoder.write_all(head.as_bytes())?;
        encoder.write_all(record.block)?;
        encoder.write_all(b"\r\n\r\n")?;
        encoder.finish()?;
        Ok(record_id)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn http_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Event handler rendering the WARC output contract.
pub struct WarcHandler<W: Write + Send> {
    writer: WarcWriter<W>,
    logger: Logger,
    log_buffer: Arc<Mutex<Vec<String>>>,
    /// Most recent Document response record per URL, referenced by
    /// screenshot and snapshot records.
    document_records: HashMap<Url, String>,
}

impl<W: Write + Send> WarcHandler<W> {
    pub fn new(out: W, logger: &Logger) -> Self {
        Self {
            writer: WarcWriter::new(out),
            logger: logger.bind(json!({"context": "WarcHandler"})),
            log_buffer: Arc::new(Mutex::new(Vec::new())),
            document_records: HashMap::new(),
        }
    }

    /// Consumer feeding the logger's output into this archive's metadata
    /// records.
    pub fn log_consumer(&self) -> Arc<dyn Consumer> {
        Arc::new(BufferConsumer::new(self.log_buffer.clone(), Level::Debug))
    }

    fn write_warcinfo(&mut self, payload: &Value) -> Result<()> {
        let block = serde_json::to_vec(payload)?;
        self.writer.write_record(Record {
            kind: "warcinfo",
            target_uri: None,
            date: Utc::now(),
            content_type: "application/json; charset=utf-8",
            extra: Vec::new(),
            block: &block,
        })?;
        Ok(())
    }

    fn write_request(&mut self, pair: &RequestResponsePair) -> Result<String> {
        let request = &pair.request;
        let mut block = Vec::new();
        block.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", request.method, http_path(&pair.url)).as_bytes(),
        );
        for (name, value) in request.headers.iter() {
            block.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        block.extend_from_slice(b"\r\n");
        if let Some(body) = &request.body {
            block.extend_from_slice(body.as_bytes());
        }

        let mut extra = vec![("X-Chrome-Request-ID".to_string(), pair.id.clone())];
        if let Some(initiator) = &request.initiator {
            extra.push(("X-Chrome-Initiator".to_string(), serde_json::to_string(initiator)?));
        }
        if let Some(body) = &request.body {
            extra.push(("X-Chrome-Base64Body".to_string(), (!body.is_unicode()).to_string()));
        }

        self.writer.write_record(Record {
            kind: "request",
            target_uri: Some(pair.url.as_str()),
            date: request.timestamp,
            content_type: "application/http; msgtype=request",
            extra,
            block: &block,
        })
    }

    fn write_response(&mut self, pair: &RequestResponsePair, concurrent_to: &str) -> Result<()> {
        let Some(response) = &pair.response else { return Ok(()) };

        let mut headers = response.headers.clone();
        // content is stored decoded and decompressed
        headers.remove("transfer-encoding");
        headers.remove("content-encoding");
        let body_len = response.body.as_ref().map(|b| b.len()).unwrap_or(0);
        headers.replace("content-length", body_len.to_string());
        if let Some(mime) = &response.mime_type {
            // the browser hands over nothing but utf-8 text; headers take
            // precedence over the document's meta, so override the charset
            let content_type = if response.body.as_ref().map(|b| b.is_unicode()).unwrap_or(false) {
                format!("{mime}; charset=utf-8")
            } else {
                mime.clone()
            };
            headers.replace("content-type", content_type);
        }

        let status_text = util::status_text(response.status, response.status_text.as_deref());
        let mut block = Vec::new();
        block.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", response.status, status_text).as_bytes(),
        );
        for (name, value) in headers.iter() {
            block.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        block.extend_from_slice(b"\r\n");
        if let Some(body) = &response.body {
            block.extend_from_slice(body.as_bytes());
        }

        let mut extra = vec![
            ("WARC-Concurrent-To".to_string(), concurrent_to.to_string()),
            ("X-Chrome-Request-ID".to_string(), pair.id.clone()),
        ];
        if let Some(address) = &pair.remote_address {
            extra.push(("WARC-IP-Address".to_string(), address.clone()));
        }
        if let Some(protocol) = &pair.protocol {
            extra.push(("X-Chrome-Protocol".to_string(), protocol.clone()));
        }
        if let Some(from_cache) = response.from_disk_cache {
            extra.push(("X-Chrome-FromDiskCache".to_string(), from_cache.to_string()));
        }
        if let Some(reused) = response.connection_reused {
            extra.push(("X-Chrome-ConnectionReused".to_string(), reused.to_string()));
        }
        if let Some(body) = &response.body {
            extra.push(("X-Chrome-Base64Body".to_string(), (!body.is_unicode()).to_string()));
        }
        if response.truncated {
            extra.push(("WARC-Truncated".to_string(), "unspecified".to_string()));
        }

        let record_id = self.writer.write_record(Record {
            kind: "response",
            target_uri: Some(pair.url.as_str()),
            date: response.timestamp,
            content_type: "application/http; msgtype=response",
            extra,
            block: &block,
        })?;

        if pair.resource_type == Some(ResourceType::Document) {
            self.document_records.insert(pair.url.clone(), record_id);
        }
        Ok(())
    }

    fn write_pair(&mut self, pair: &RequestResponsePair) -> Result<()> {
        let concurrent_to = self.write_request(pair)?;
        self.write_response(pair, &concurrent_to)
    }

    fn write_script(&mut self, script: &Script) -> Result<()> {
        let target = match (&script.abspath, &script.path) {
            (Some(abspath), _) => format!("file://{abspath}"),
            (None, Some(path)) => format!("urn:crocoite:script/{path}"),
            (None, None) => "urn:crocoite:script".to_string(),
        };
        self.writer.write_record(Record {
            kind: "resource",
            target_uri: Some(&target),
            date: Utc::now(),
            content_type: "application/javascript; charset=utf-8",
            extra: vec![("X-Crocoite-Type".to_string(), "script".to_string())],
            block: script.data.as_bytes(),
        })?;
        Ok(())
    }

    fn refers_to(&self, url: Option<&Url>) -> Vec<(String, String)> {
        url.and_then(|u| self.document_records.get(u))
            .map(|record_id| vec![("WARC-Refers-To".to_string(), record_id.clone())])
            .unwrap_or_default()
    }

    fn write_screenshot(&mut self, screenshot: &ScreenshotEvent) -> Result<()> {
        let mut extra = self.refers_to(screenshot.url.as_ref());
        extra.push((
            "X-Crocoite-Screenshot-Y-Offset".to_string(),
            screenshot.yoff.to_string(),
        ));
        let target = screenshot
            .url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "urn:crocoite:screenshot".to_string());
        self.writer.write_record(Record {
            kind: "conversion",
            target_uri: Some(&target),
            date: Utc::now(),
            content_type: "image/png",
            extra,
            block: &screenshot.data,
        })?;
        Ok(())
    }

    fn write_dom_snapshot(&mut self, snapshot: &DomSnapshotEvent) -> Result<()> {
        let mut extra = self.refers_to(Some(&snapshot.url));
        extra.push(("X-Chrome-Viewport".to_string(), snapshot.viewport.clone()));
        let target = snapshot.url.to_string();
        self.writer.write_record(Record {
            kind: "conversion",
            target_uri: Some(&target),
            date: Utc::now(),
            content_type: "text/html; charset=utf-8",
            extra,
            block: &snapshot.document,
        })?;
        Ok(())
    }

    fn flush_logs(&mut self, force: bool) -> Result<()> {
        let lines: Vec<String> = {
            let Ok(mut buffer) = self.log_buffer.lock() else { return Ok(()) };
            if buffer.is_empty() || (!force && buffer.len() < LOG_BUFFER_CAPACITY) {
                return Ok(());
            }
            buffer.drain(..).collect()
        };
        let mut block = lines.join("\n");
        block.push('\n');
        self.writer.write_record(Record {
            kind: "metadata",
            target_uri: Some("urn:crocoite:log"),
            date: Utc::now(),
            content_type: "application/json; charset=utf-8",
            extra: vec![("X-Crocoite-Type".to_string(), "log".to_string())],
            block: block.as_bytes(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl<W: Write + Send> EventHandler for WarcHandler<W> {
    async fn push(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::ControllerStart(payload) => self.write_warcinfo(payload)?,
            Event::Pair(pair) => self.write_pair(pair)?,
            Event::Script(script) => self.write_script(script)?,
            Event::Screenshot(screenshot) => self.write_screenshot(screenshot)?,
            Event::DomSnapshot(snapshot) => self.write_dom_snapshot(snapshot)?,
            Event::PageIdle(_) | Event::FrameNavigated(_) | Event::ExtractLinks(_) => {
                self.logger.debug(
                    "event not archived",
                    json!({"uuid": "dc54eead-42a8-4f5b-a6ea-a2f2e5e1bd7b"}),
                );
            }
        }
        self.flush_logs(false)
    }

    async fn flush(&mut self) -> Result<()> {
        self.flush_logs(true)
    }
}
