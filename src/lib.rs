//! # crocoite
//!
//! Archive modern, JavaScript-heavy web pages into WARC files by driving a
//! headless Chromium-family browser through its DevTools protocol.
//!
//! The grab engine drives one browser tab to completion per run: the
//! [`devtools`] module supervises the browser process and multiplexes the
//! wire protocol, [`browser`] reassembles network events into
//! request/response pairs, [`behavior`] injects scripts and produces
//! synthetic artifacts (screenshots, DOM snapshots, extracted links), and
//! [`controller`] sequences navigation, idle detection and timeouts while
//! fanning every event out to its consumers — most importantly the
//! [`warc`] writer.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use crocoite::{
//!     BrowserService, ControllerSettings, Logger, Process, SinglePageController, WarcHandler,
//! };
//!
//! #[tokio::main]
//! async fn main() -> crocoite::Result<()> {
//!     let logger = Logger::new();
//!     let output = std::fs::File::create("page.warc.gz")?;
//!     let warc = WarcHandler::new(output, &logger);
//!
//!     let controller = SinglePageController {
//!         url: "https://example.com/".parse().expect("static url"),
//!         service: BrowserService::Spawned(Process::new("google-chrome-stable")),
//!         settings: ControllerSettings::default(),
//!         behavior_names: crocoite::behavior::default_names(),
//!         warcinfo: None,
//!         logger,
//!         handlers: vec![Box::new(warc)],
//!     };
//!     controller.run().await
//! }
//! ```
//!
//! ## CLI usage
//!
//! ```bash
//! crocoite-single http://example.com/ example.warc.gz
//! ```

/// Behavior scripts driving the page during the grab
pub mod behavior;

/// Site loading and request/response pair assembly
pub mod browser;

/// Command-line interface implementation
pub mod cli;

/// Grab sequencing, event dispatch and idle/timeout handling
pub mod controller;

/// Browser process supervision and DevTools transport
pub mod devtools;

/// Error types and exit-code mapping
pub mod error;

/// DOM snapshot serialization
pub mod html;

/// Structured logging with WARC fan-out
pub mod logger;

/// Small shared helpers
pub mod util;

/// WARC record serialization
pub mod warc;


pub use behavior::{Behavior, DomSnapshotEvent, ExtractLinksEvent, Script, ScreenshotEvent};
pub use browser::{
    Body, FrameNavigated, Headers, Request, RequestResponsePair, ResourceType, Response,
    SiteLoader,
};
pub use controller::{
    ControllerSettings, Event, EventHandler, EventSink, IdleStateTracker, LogHandler,
    SinglePageController, Stats, StatsHandler,
};
pub use devtools::{Browser, BrowserService, Passthrough, Process, Tab, TabDescriptor, TabEvents};
pub use error::{Error, Result};
pub use logger::{Consumer, Level, Logger};
pub use warc::{WarcHandler, WarcWriter};
