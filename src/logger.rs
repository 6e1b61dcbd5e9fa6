//! Structured logging for archival output.
//!
//! Components are handed a [`Logger`] and bind context to their name so the
//! source of a message can be identified. Every log call site carries a
//! stable uuid for automated identification, a short human-readable message
//! and arbitrary JSON payload. Consumers fan the entries out, usually to
//! stderr and to a buffered sink that ends up inside the WARC file.

use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde_json::{Map, Value};

/// Log severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// Receives every entry emitted through a [`Logger`].
pub trait Consumer: Send + Sync {
    fn consume(&self, level: Level, entry: &Map<String, Value>);
}

/// Context-binding logger with shared consumers.
///
/// `bind` produces a child logger carrying extra fields; consumers are
/// shared, so connecting one to the parent attaches it to all children as
/// well.
#[derive(Clone, Default)]
pub struct Logger {
    bindings: Map<String, Value>,
    consumers: Arc<RwLock<Vec<Arc<dyn Consumer>>>>,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, consumer: Arc<dyn Consumer>) {
        if let Ok(mut consumers) = self.consumers.write() {
            consumers.push(consumer);
        }
    }

    /// Child logger with additional bound fields.
    pub fn bind(&self, fields: Value) -> Logger {
        let mut bindings = self.bindings.clone();
        if let Value::Object(map) = fields {
            for (k, v) in map {
                bindings.insert(k, v);
            }
        }
        Logger { bindings, consumers: self.consumers.clone() }
    }

    pub fn log(&self, level: Level, msg: &str, fields: Value) {
        let mut entry = Map::new();
        if let Value::Object(map) = fields {
            entry = map;
        }
        entry.insert("msg".into(), Value::String(msg.into()));
        entry.insert("level".into(), Value::String(level.as_str().into()));
        entry.insert("date".into(), Value::String(Utc::now().to_rfc3339()));
        // bindings never overwrite call-site fields
        for (k, v) in &self.bindings {
            entry.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if let Ok(consumers) = self.consumers.read() {
            for c in consumers.iter() {
                c.consume(level, &entry);
            }
        }
    }

    pub fn debug(&self, msg: &str, fields: Value) {
        self.log(Level::Debug, msg, fields);
    }

    pub fn info(&self, msg: &str, fields: Value) {
        self.log(Level::Info, msg, fields);
    }

    pub fn warning(&self, msg: &str, fields: Value) {
        self.log(Level::Warning, msg, fields);
    }

    pub fn error(&self, msg: &str, fields: Value) {
        self.log(Level::Error, msg, fields);
    }
}

/// Writes one JSON object per line to stderr.
pub struct JsonPrintConsumer {
    min_level: Level,
}

impl JsonPrintConsumer {
    pub fn new(min_level: Level) -> Self {
        Self { min_level }
    }
}

impl Consumer for JsonPrintConsumer {
    fn consume(&self, level: Level, entry: &Map<String, Value>) {
        if level < self.min_level {
            return;
        }
        let stderr = std::io::stderr();
        let mut lock = stderr.lock();
        if serde_json::to_writer(&mut lock, entry).is_ok() {
            let _ = lock.write_all(b"\n");
        }
    }
}

/// Buffers serialized entries for a WARC metadata record.
///
/// The buffer is shared with the WARC handler, which drains it into
/// `metadata` records once it grows past its capacity and when the archive
/// is finalized.
pub struct BufferConsumer {
    buffer: Arc<Mutex<Vec<String>>>,
    min_level: Level,
}

impl BufferConsumer {
    pub fn new(buffer: Arc<Mutex<Vec<String>>>, min_level: Level) -> Self {
        Self { buffer, min_level }
    }
}

impl Consumer for BufferConsumer {
    fn consume(&self, level: Level, entry: &Map<String, Value>) {
        if level < self.min_level {
            return;
        }
        if let Ok(line) = serde_json::to_string(entry) {
            if let Ok(mut buffer) = self.buffer.lock() {
                buffer.push(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Capture(Arc<Mutex<Vec<Map<String, Value>>>>);

    impl Consumer for Capture {
        fn consume(&self, _level: Level, entry: &Map<String, Value>) {
            self.0.lock().unwrap().push(entry.clone());
        }
    }

    #[test]
    fn test_bindings_do_not_overwrite_fields() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let logger = Logger::new();
        logger.connect(Arc::new(Capture(seen.clone())));
        let child = logger.bind(json!({"context": "Parent", "url": "http://a.example"}));
        child.info("hello", json!({"context": "Child"}));

        let entries = seen.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["context"], "Child");
        assert_eq!(entries[0]["url"], "http://a.example");
        assert_eq!(entries[0]["msg"], "hello");
        assert_eq!(entries[0]["level"], "INFO");
        assert!(entries[0].contains_key("date"));
    }

    #[test]
    fn test_consumer_shared_with_children() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let logger = Logger::new();
        let child = logger.bind(json!({"context": "Child"}));
        // connecting to the parent after the child exists still reaches it
        logger.connect(Arc::new(Capture(seen.clone())));
        child.debug("late", json!({}));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_buffer_consumer_level_filter() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let logger = Logger::new();
        logger.connect(Arc::new(BufferConsumer::new(buffer.clone(), Level::Info)));
        logger.debug("dropped", json!({}));
        logger.warning("kept", json!({"uuid": "c95b8f17-a20f-4ab2-ad7a-57609b1a4af6"}));

        let lines = buffer.lock().unwrap();
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["msg"], "kept");
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warning < Level::Error);
        assert_eq!(Level::Warning.as_str(), "WARNING");
    }
}
