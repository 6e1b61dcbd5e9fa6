use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use url::Url;

use crate::behavior;
use crate::controller::{ControllerSettings, LogHandler, SinglePageController, StatsHandler};
use crate::devtools::{BrowserService, Passthrough, Process};
use crate::error::{Error, Result};
use crate::logger::{JsonPrintConsumer, Level, Logger};
use crate::warc::WarcHandler;

#[derive(Parser)]
#[command(name = "crocoite-single")]
#[command(about = "Save a single web page to WARC using a headless browser")]
#[command(version)]
pub struct Cli {
    /// Website URL to archive
    pub url: String,

    /// WARC output file
    pub output: PathBuf,

    #[arg(long, default_value_t = 10, help = "Maximum time for the whole grab in seconds")]
    pub timeout: u64,

    #[arg(
        long = "idle-timeout",
        default_value_t = 2,
        help = "Maximum idle seconds (i.e. no loading frames)"
    )]
    pub idle_timeout: u64,

    #[arg(long = "behavior", help = "Enable only these behavior scripts (default: all)")]
    pub behavior: Vec<String>,

    #[arg(long, help = "Extra JSON metadata merged into the warcinfo record")]
    pub warcinfo: Option<String>,

    #[arg(short = 'k', long, help = "Do not validate certificates")]
    pub insecure: bool,

    #[arg(long, help = "DevTools URL of an already running browser")]
    pub browser: Option<Url>,

    #[arg(long, default_value = "google-chrome-stable", help = "Browser binary to spawn")]
    pub binary: String,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub async fn run(args: Cli) -> Result<()> {
    let url = Url::parse(&args.url).map_err(|e| Error::InvalidUrl(format!("{}: {e}", args.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl(format!("refusing scheme {}", url.scheme())));
    }

    let warcinfo = args.warcinfo.as_deref().map(serde_json::from_str).transpose()?;
    let behavior_names = if args.behavior.is_empty() {
        behavior::default_names()
    } else {
        args.behavior.clone()
    };

    let service = match &args.browser {
        Some(endpoint) => BrowserService::Remote(Passthrough::new(endpoint.clone())),
        None => BrowserService::Spawned(Process::new(args.binary.clone())),
    };

    let logger = Logger::new();
    let min_level = if args.verbose { Level::Debug } else { Level::Info };
    logger.connect(Arc::new(JsonPrintConsumer::new(min_level)));

    let output = std::fs::File::create(&args.output)?;
    let warc = WarcHandler::new(std::io::BufWriter::new(output), &logger);
    logger.connect(warc.log_consumer());

    let stats_handler = StatsHandler::new();
    let stats = stats_handler.stats();

    let controller = SinglePageController {
        url,
        service,
        settings: ControllerSettings {
            idle_timeout: Duration::from_secs(args.idle_timeout),
            timeout: Duration::from_secs(args.timeout),
            insecure: args.insecure,
        },
        behavior_names,
        warcinfo,
        logger: logger.clone(),
        handlers: vec![
            Box::new(stats_handler),
            Box::new(LogHandler::new(&logger)),
            Box::new(warc),
        ],
    };
    controller.run().await?;

    if let Ok(stats) = stats.lock() {
        logger.info(
            "stats",
            json!({
                "uuid": "24d92d16-770e-4088-b769-4020e127a7ff",
                "requests": stats.requests,
                "finished": stats.finished,
                "failed": stats.failed,
                "bytesRcv": stats.bytes_rcv,
            }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Cli::parse_from(["crocoite-single", "http://example.com/", "out.warc.gz"]);
        assert_eq!(args.url, "http://example.com/");
        assert_eq!(args.output, PathBuf::from("out.warc.gz"));
        assert_eq!(args.timeout, 10);
        assert_eq!(args.idle_timeout, 2);
        assert!(args.behavior.is_empty());
        assert!(!args.insecure);
        assert!(args.browser.is_none());
    }

    #[test]
    fn test_cli_flags() {
        let args = Cli::parse_from([
            "crocoite-single",
            "--timeout",
            "30",
            "--idle-timeout",
            "5",
            "--behavior",
            "scroll",
            "--behavior",
            "screenshot",
            "-k",
            "--browser",
            "http://localhost:9222",
            "http://example.com/",
            "out.warc.gz",
        ]);
        assert_eq!(args.timeout, 30);
        assert_eq!(args.idle_timeout, 5);
        assert_eq!(args.behavior, vec!["scroll", "screenshot"]);
        assert!(args.insecure);
        assert_eq!(args.browser.unwrap().as_str(), "http://localhost:9222/");
    }

    #[tokio::test]
    async fn test_run_rejects_bad_scheme() {
        let args = Cli::parse_from(["crocoite-single", "ftp://example.com/", "/dev/null"]);
        match run(args).await {
            Err(Error::InvalidUrl(_)) => {}
            other => panic!("expected InvalidUrl, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_rejects_bad_warcinfo() {
        let args = Cli::parse_from([
            "crocoite-single",
            "--warcinfo",
            "{not json",
            "http://example.com/",
            "/dev/null",
        ]);
        assert!(matches!(run(args).await, Err(Error::Json(_))));
    }
}
